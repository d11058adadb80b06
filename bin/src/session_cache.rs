//! Per-host cache of reusable transport sessions.
//!
//! Entries of a host are kept in the order they were returned, oldest at the front.
//! Since every entry is stamped with the time of its return, an expired newest entry
//! means the whole list is expired.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};

use crate::{clock::Clock, transport::Transport};

/// A session checked out of the cache, tagged with the host it belongs to.
#[derive(Debug)]
pub struct PooledSession<S> {
    /// Host the session is pooled under, `None` when the URL had no host.
    host: Option<String>,
    /// The transport session.
    session: S,
}

impl<S> PooledSession<S> {
    /// Host the session will be returned to.
    #[must_use]
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    /// The transport session.
    pub fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }

    /// Unwraps the transport session.
    pub fn into_inner(self) -> S {
        self.session
    }
}

/// A pooled session and the time it was returned.
struct CacheEntry<S> {
    /// The transport session.
    session: S,
    /// When the session was returned to the cache.
    last_use: DateTime<Utc>,
}

/// Per-host session pool with time based expiry and bounded capacity.
pub struct SessionCache<T: Transport> {
    /// Session factory.
    transport: Arc<T>,
    /// Time source for expiry.
    clock: Arc<dyn Clock>,
    /// A session returned this long ago is no longer reused.
    max_age: TimeDelta,
    /// Pool capacity per host, `0` disables pooling.
    max_sessions_per_host: usize,
    /// Pooled sessions by host, oldest first.
    hosts: Mutex<HashMap<String, VecDeque<CacheEntry<T::Session>>>>,
}

impl<T: Transport> SessionCache<T> {
    /// Creates an empty cache.
    pub fn new(
        transport: Arc<T>, clock: Arc<dyn Clock>, max_age: Duration, max_sessions_per_host: usize,
    ) -> Self {
        Self {
            transport,
            clock,
            max_age: TimeDelta::from_std(max_age).unwrap_or(TimeDelta::MAX),
            max_sessions_per_host,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    /// Locks the pool.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<CacheEntry<T::Session>>>> {
        self.hosts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the newest live session of the URL's host, or a fresh one.
    pub fn get_session(&self, url: &str) -> PooledSession<T::Session> {
        let host = host_of(url);

        if self.max_sessions_per_host > 0 {
            if let Some(host) = &host {
                if let Some(session) = self.take_newest(host) {
                    tracing::trace!(%host, "reusing pooled session");
                    return PooledSession {
                        host: Some(host.clone()),
                        session,
                    };
                }
            }
        }

        tracing::trace!(host = host.as_deref().unwrap_or_default(), "creating session");
        PooledSession {
            host,
            session: self.transport.create_session(),
        }
    }

    /// Gives a session back to its host's pool, evicting expired or surplus entries
    /// first.
    pub fn return_session(&self, pooled: PooledSession<T::Session>) {
        if self.max_sessions_per_host == 0 {
            return;
        }
        let Some(host) = pooled.host else {
            return;
        };
        let now = self.clock.now();

        let mut hosts = self.lock();
        let entries = hosts.entry(host).or_default();
        self.free_space(entries, now);
        entries.push_back(CacheEntry {
            session: pooled.session,
            last_use: now,
        });
    }

    /// Number of sessions pooled for `host`.
    #[must_use]
    pub fn pooled_count(&self, host: &str) -> usize {
        self.lock().get(host).map_or(0, VecDeque::len)
    }

    /// Pops the newest entry of `host` unless it has expired, in which case the whole
    /// host list is dropped.
    fn take_newest(&self, host: &str) -> Option<T::Session> {
        let now = self.clock.now();
        let mut hosts = self.lock();
        let entries = hosts.get_mut(host)?;

        if entries.back().is_some_and(|entry| self.is_expired(entry, now)) {
            tracing::trace!(%host, dropped = entries.len(), "pooled sessions expired");
            entries.clear();
            return None;
        }
        entries.pop_back().map(|entry| entry.session)
    }

    /// Makes room for one more entry in a full host list.
    fn free_space(&self, entries: &mut VecDeque<CacheEntry<T::Session>>, now: DateTime<Utc>) {
        if entries.len() < self.max_sessions_per_host {
            return;
        }

        let first_live = entries.partition_point(|entry| self.is_expired(entry, now));
        let evict = if first_live > 0 {
            first_live
        } else {
            entries
                .len()
                .saturating_sub(self.max_sessions_per_host)
                .saturating_add(1)
        };
        entries.drain(..evict.min(entries.len()));
    }

    /// Whether an entry is too old to be reused at `now`.
    fn is_expired(&self, entry: &CacheEntry<T::Session>, now: DateTime<Utc>) -> bool {
        entry
            .last_use
            .checked_add_signed(self.max_age)
            .is_none_or(|deadline| deadline <= now)
    }
}

/// Host part of a URL, `None` if it cannot be parsed or has no host.
fn host_of(url: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()?
        .host_str()
        .filter(|host| !host.is_empty())
        .map(str::to_string)
}
