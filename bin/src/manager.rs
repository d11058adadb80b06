//! Client manager: the handle based front of the library.
//!
//! It owns every request engine ("client"), the options being built and the
//! requests sent so far, all addressed by small integer handles. Two main clients,
//! one per end-of-life policy, always exist. Other clients belong to an owner (a
//! plugin or module of the host) and go away when the owner unloads, but only once
//! their in-flight requests have drained.
//!
//! Everything here runs on the host thread. Engines hand completed responses over
//! through a staging queue, and `run_frame` applies them to the request records
//! before running the caller callbacks, which get `&mut ClientManager` back.

use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    rc::Rc,
    sync::Arc,
    thread,
    time::Duration,
};

use crate::{
    arena::{ClientId, HandleArena, OptionsId, RequestId},
    clock::{Clock, SystemClock},
    config::Config,
    control::{RequestControl, RequestProgress},
    engine::RequestEngine,
    errors::ManagerError,
    options::{EndOfLifePolicy, OptionsBuilder, RequestMethod, RequestOptions},
    response::Response,
    transport::{
        reqwest::{ReqwestConfig, ReqwestTransport},
        Transport,
    },
};

/// Completion callback of a request sent through the manager.
pub type ManagerCallback<T> = Box<dyn FnOnce(&mut ClientManager<T>, RequestId)>;

/// How a client relates to other clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientRole {
    /// No pairing.
    Standalone,
    /// Cancel-policy half of a pair, options asking to be forgotten go to the twin.
    PairedCancel {
        /// The forget-policy half.
        twin: ClientId,
    },
    /// Forget-policy half of a pair, options asking to be cancelled go to the twin.
    PairedForget {
        /// The cancel-policy half.
        twin: ClientId,
    },
}

impl ClientRole {
    /// The other half of a pair.
    fn twin(self) -> Option<ClientId> {
        match self {
            Self::Standalone => None,
            Self::PairedCancel { twin } | Self::PairedForget { twin } => Some(twin),
        }
    }
}

/// A client and its engine.
struct ClientRecord<T: Transport> {
    /// Owner, `None` for the main clients.
    owner: Option<String>,
    /// Stable name within the owner.
    name: Option<String>,
    /// What happens to in-flight requests when the owner goes away.
    policy: EndOfLifePolicy,
    /// Pairing.
    role: ClientRole,
    /// Accepts no requests and is removed once drained.
    marked_for_destruction: bool,
    /// Tells this client apart from later clients reusing its handle.
    serial: u64,
    /// The engine running this client's requests.
    engine: RequestEngine<T>,
}

impl<T: Transport> ClientRecord<T> {
    /// Cancels or forgets everything in flight, as the policy says.
    fn end_requests(&mut self) {
        match self.policy {
            EndOfLifePolicy::CancelRequests => self.engine.cancel_all_requests(),
            EndOfLifePolicy::ForgetRequests => self.engine.forget_all_requests(),
        }
    }
}

/// Options record.
enum OptionsState {
    /// Still being configured.
    Building(OptionsBuilder),
    /// Frozen by the request that used them.
    Sent(Arc<RequestOptions>),
}

/// Request record.
struct RequestRecord<T: Transport> {
    /// Client running the request.
    client: ClientId,
    /// Serial of that client.
    client_serial: u64,
    /// Options the request was sent with.
    options: OptionsId,
    /// Identifies this send, so a completion never lands on a reused handle.
    ticket: u64,
    /// Control block shared with the transfer.
    control: Arc<RequestControl>,
    /// Set when the completion is delivered.
    response: Option<Response>,
    /// Caller data copied from the options.
    user_data: Option<Vec<u8>>,
    /// Caller callback, taken on delivery.
    callback: Option<ManagerCallback<T>>,
}

/// A completion waiting to be applied to its request record.
struct Delivery {
    /// Target request.
    request_id: RequestId,
    /// Ticket of the send that produced it.
    ticket: u64,
    /// The response.
    response: Response,
}

/// Staging queue shared with the engine callbacks.
type Deliveries = Rc<RefCell<VecDeque<Delivery>>>;

/// Handle based client manager.
pub struct ClientManager<T: Transport = ReqwestTransport> {
    /// Settings.
    config: Config,
    /// Transport shared by all engines.
    transport: Arc<T>,
    /// Clock shared by all session caches.
    clock: Arc<dyn Clock>,
    /// Clients.
    clients: HandleArena<ClientId, ClientRecord<T>>,
    /// Named clients by `(owner, name)`.
    names: HashMap<(String, String), ClientId>,
    /// Main cancel-policy client.
    main_cancel: ClientId,
    /// Main forget-policy client.
    main_forget: ClientId,
    /// Engines replaced by a reset, pumped until drained.
    retired: Vec<RequestEngine<T>>,
    /// Options.
    options: HandleArena<OptionsId, OptionsState>,
    /// Requests.
    requests: HandleArena<RequestId, RequestRecord<T>>,
    /// Completions not yet applied.
    deliveries: Deliveries,
    /// Ticket of the next send.
    next_ticket: u64,
    /// Serial of the next client.
    next_client_serial: u64,
}

impl ClientManager<ReqwestTransport> {
    /// Creates a manager over the bundled `reqwest` transport and the wall clock.
    ///
    /// # Errors
    /// - `ManagerError::HandlesExhausted` when `max_handle` leaves no room for the two
    ///   main clients.
    pub fn new(config: Config) -> Result<Self, ManagerError> {
        let transport = ReqwestTransport::new(ReqwestConfig {
            ca_cert_path: config.ca_cert_path.clone(),
        });
        Self::with_transport(config, Arc::new(transport), Arc::new(SystemClock))
    }
}

impl<T: Transport> ClientManager<T> {
    /// Creates a manager over any transport and clock.
    ///
    /// # Errors
    /// - `ManagerError::HandlesExhausted` when `max_handle` leaves no room for the two
    ///   main clients.
    pub fn with_transport(
        config: Config, transport: Arc<T>, clock: Arc<dyn Clock>,
    ) -> Result<Self, ManagerError> {
        let mut manager = Self {
            clients: HandleArena::new(config.max_handle),
            names: HashMap::new(),
            main_cancel: ClientId::NULL,
            main_forget: ClientId::NULL,
            retired: Vec::new(),
            options: HandleArena::new(config.max_handle),
            requests: HandleArena::new(config.max_handle),
            deliveries: Deliveries::default(),
            next_ticket: 0,
            next_client_serial: 0,
            transport,
            clock,
            config,
        };
        let threads = manager.config.main_client_threads;
        let (cancel, forget) = manager.insert_pair(None, threads)?;
        manager.main_cancel = cancel;
        manager.main_forget = forget;
        Ok(manager)
    }

    /// Settings.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Creates empty options.
    ///
    /// # Errors
    /// - `ManagerError::HandlesExhausted`
    pub fn create_options(&mut self) -> Result<OptionsId, ManagerError> {
        Ok(self
            .options
            .insert(OptionsState::Building(OptionsBuilder::new()))?)
    }

    /// Deletes options. Requests already sent with them are not affected.
    pub fn delete_options(&mut self, id: OptionsId) -> bool {
        self.options.remove(id).is_some()
    }

    /// Whether the options exist.
    #[must_use]
    pub fn options_exist(&self, id: OptionsId) -> bool {
        self.options.contains(id)
    }

    /// Builder of options that have not been sent yet.
    ///
    /// # Errors
    /// - `ManagerError::UnknownOptions`
    /// - `ManagerError::OptionsConsumed`
    pub fn options_mut(&mut self, id: OptionsId) -> Result<&mut OptionsBuilder, ManagerError> {
        match self.options.get_mut(id) {
            Some(OptionsState::Building(builder)) => Ok(builder),
            Some(OptionsState::Sent(_)) => Err(ManagerError::OptionsConsumed(id)),
            None => Err(ManagerError::UnknownOptions(id)),
        }
    }

    /// Main client of a policy.
    #[must_use]
    pub fn main_client(&self, policy: EndOfLifePolicy) -> ClientId {
        match policy {
            EndOfLifePolicy::CancelRequests => self.main_cancel,
            EndOfLifePolicy::ForgetRequests => self.main_forget,
        }
    }

    /// Creates an anonymous client. `threads` defaults to `client_threads`.
    ///
    /// # Errors
    /// - `ManagerError::HandlesExhausted`
    pub fn create_client(
        &mut self, owner: &str, policy: EndOfLifePolicy, threads: Option<usize>,
    ) -> Result<ClientId, ManagerError> {
        let engine = self.new_engine(threads.unwrap_or(self.config.client_threads));
        let serial = self.take_client_serial();
        let id = self.clients.insert(ClientRecord {
            owner: Some(owner.to_string()),
            name: None,
            policy,
            role: ClientRole::Standalone,
            marked_for_destruction: false,
            serial,
            engine,
        })?;
        tracing::info!(client = %id, owner, ?policy, "client created");
        Ok(id)
    }

    /// Creates a client with a name unique within its owner. The name stays taken
    /// until the client is destroyed and drained.
    ///
    /// # Errors
    /// - `ManagerError::NameTaken`
    /// - `ManagerError::HandlesExhausted`
    pub fn create_named_client(
        &mut self, owner: &str, name: &str, policy: EndOfLifePolicy, threads: Option<usize>,
    ) -> Result<ClientId, ManagerError> {
        let key = (owner.to_string(), name.to_string());
        if self.names.contains_key(&key) {
            return Err(ManagerError::NameTaken {
                owner: key.0,
                name: key.1,
            });
        }

        let id = self.create_client(owner, policy, threads)?;
        if let Some(record) = self.clients.get_mut(id) {
            record.name = Some(name.to_string());
        }
        self.names.insert(key, id);
        Ok(id)
    }

    /// Named client of an owner, unless it is being destroyed.
    #[must_use]
    pub fn find_client(&self, owner: &str, name: &str) -> Option<ClientId> {
        let id = *self.names.get(&(owner.to_string(), name.to_string()))?;
        self.client_exists(id).then_some(id)
    }

    /// Creates a cancel-policy client paired with a hidden forget-policy twin, and
    /// returns the cancel half. Options targeting it while asking to be forgotten run
    /// on the twin.
    ///
    /// # Errors
    /// - `ManagerError::HandlesExhausted`
    pub fn create_legacy_client(
        &mut self, owner: &str, threads: Option<usize>,
    ) -> Result<ClientId, ManagerError> {
        let threads = threads.unwrap_or(self.config.client_threads);
        let (cancel, _) = self.insert_pair(Some(owner), threads)?;
        Ok(cancel)
    }

    /// Whether the client exists and accepts requests.
    #[must_use]
    pub fn client_exists(&self, id: ClientId) -> bool {
        self.clients
            .get(id)
            .is_some_and(|record| !record.marked_for_destruction)
    }

    /// Policy of a client.
    #[must_use]
    pub fn client_policy(&self, id: ClientId) -> Option<EndOfLifePolicy> {
        self.clients.get(id).map(|record| record.policy)
    }

    /// In-flight requests of a client, including ones waiting for `run_frame`.
    #[must_use]
    pub fn client_active_requests(&self, id: ClientId) -> Option<usize> {
        self.clients
            .get(id)
            .map(|record| record.engine.active_request_count())
    }

    /// Sends a request. Without an options handle, default options are created for
    /// it. The options are frozen by the send.
    ///
    /// The target client is the one the options name, or the main client of the
    /// requested policy. On error nothing changes.
    ///
    /// # Errors
    /// - `ManagerError::UnknownOptions`
    /// - `ManagerError::OptionsConsumed`
    /// - `ManagerError::UnknownClient`
    /// - `ManagerError::ClientDestroyed`
    /// - `ManagerError::IncompatibleOptions`
    /// - `ManagerError::HandlesExhausted`
    pub fn send_request(
        &mut self, method: RequestMethod, url: &str, options: Option<OptionsId>,
        callback: impl FnOnce(&mut Self, RequestId) + 'static,
    ) -> Result<RequestId, ManagerError> {
        let frozen = match options {
            Some(id) => {
                match self.options.get(id) {
                    Some(OptionsState::Building(builder)) => builder.options().clone(),
                    Some(OptionsState::Sent(_)) => return Err(ManagerError::OptionsConsumed(id)),
                    None => return Err(ManagerError::UnknownOptions(id)),
                }
            },
            None => RequestOptions::default(),
        };
        let target = self.resolve_client(&frozen)?;

        let options_id = match options {
            Some(id) => id,
            None => self.create_options()?,
        };
        let frozen = Arc::new(frozen);
        let ticket = self.next_ticket;

        let Some(client) = self.clients.get_mut(target) else {
            return Err(ManagerError::UnknownClient(target));
        };
        let client_serial = client.serial;
        let deliveries = self.deliveries.clone();
        let inserted = self.requests.insert_with(|request_id| {
            let control = client.engine.send_request(
                method,
                url,
                frozen.clone(),
                move |response| {
                    deliveries.borrow_mut().push_back(Delivery {
                        request_id,
                        ticket,
                        response,
                    });
                },
            );
            RequestRecord {
                client: target,
                client_serial,
                options: options_id,
                ticket,
                control,
                response: None,
                user_data: frozen.user_data.clone(),
                callback: Some(Box::new(callback)),
            }
        });
        let request_id = match inserted {
            Ok(request_id) => request_id,
            Err(error) => {
                if options.is_none() {
                    self.options.remove(options_id);
                }
                return Err(error.into());
            },
        };

        self.next_ticket = self.next_ticket.wrapping_add(1);
        if let Some(state) = self.options.get_mut(options_id) {
            *state = OptionsState::Sent(frozen);
        }
        tracing::debug!(request = %request_id, client = %target, ?method, url, "request sent");
        Ok(request_id)
    }

    /// Whether the request exists.
    #[must_use]
    pub fn request_exists(&self, id: RequestId) -> bool {
        self.requests.contains(id)
    }

    /// Last progress reported by the transfer.
    ///
    /// # Errors
    /// - `ManagerError::UnknownRequest`
    pub fn request_progress(&self, id: RequestId) -> Result<RequestProgress, ManagerError> {
        Ok(self.request(id)?.control.progress())
    }

    /// Cancels the request. Does nothing once it has completed.
    ///
    /// # Errors
    /// - `ManagerError::UnknownRequest`
    pub fn cancel_request(&self, id: RequestId) -> Result<(), ManagerError> {
        self.request(id)?.control.cancel();
        Ok(())
    }

    /// Whether cancellation was requested before the transfer completed.
    ///
    /// # Errors
    /// - `ManagerError::UnknownRequest`
    pub fn is_request_cancelled(&self, id: RequestId) -> Result<bool, ManagerError> {
        Ok(self.request(id)?.control.is_cancelled())
    }

    /// Whether the transfer has finished. The response may still be on its way.
    ///
    /// # Errors
    /// - `ManagerError::UnknownRequest`
    pub fn is_request_completed(&self, id: RequestId) -> Result<bool, ManagerError> {
        Ok(self.request(id)?.control.is_completed())
    }

    /// Response of a delivered request.
    ///
    /// # Errors
    /// - `ManagerError::UnknownRequest`
    /// - `ManagerError::RequestPending`
    pub fn response(&self, id: RequestId) -> Result<&Response, ManagerError> {
        self.request(id)?
            .response
            .as_ref()
            .ok_or(ManagerError::RequestPending(id))
    }

    /// Caller data attached to the options the request was sent with.
    ///
    /// # Errors
    /// - `ManagerError::UnknownRequest`
    pub fn user_data(&self, id: RequestId) -> Result<Option<&[u8]>, ManagerError> {
        Ok(self.request(id)?.user_data.as_deref())
    }

    /// Client the request runs on, `None` once that client is gone, even if a newer
    /// client now holds the same handle.
    ///
    /// # Errors
    /// - `ManagerError::UnknownRequest`
    pub fn request_client(&self, id: RequestId) -> Result<Option<ClientId>, ManagerError> {
        let record = self.request(id)?;
        let live = self
            .clients
            .get(record.client)
            .is_some_and(|client| client.serial == record.client_serial);
        Ok(live.then_some(record.client))
    }

    /// Deletes the request, and its options too if asked. A request still in flight is
    /// forgotten, its callback never runs.
    pub fn delete_request(&mut self, id: RequestId, delete_options: bool) -> bool {
        let Some(record) = self.requests.remove(id) else {
            return false;
        };
        record.control.forget();
        if delete_options {
            self.options.remove(record.options);
        }
        true
    }

    /// Pumps every engine, runs the callbacks of the delivered requests, then removes
    /// the destroyed clients that have drained. Call once per host tick.
    pub fn run_frame(&mut self) {
        for (_, client) in self.clients.iter_mut() {
            client.engine.run_frame();
        }
        for engine in &mut self.retired {
            engine.run_frame();
        }

        loop {
            let next = self.deliveries.borrow_mut().pop_front();
            let Some(delivery) = next else {
                break;
            };
            self.deliver(delivery);
        }

        self.destroy_clients();
    }

    /// Ends the requests of every client of `owner` according to its policy and
    /// marks those clients for destruction.
    pub fn unload_owner(&mut self, owner: &str) {
        let mut released = Vec::new();
        for (id, client) in self.clients.iter_mut() {
            if client.marked_for_destruction || client.owner.as_deref() != Some(owner) {
                continue;
            }
            client.end_requests();
            client.marked_for_destruction = true;
            released.push(id);
        }
        if !released.is_empty() {
            tracing::info!(owner, clients = ?released, "owner unloaded");
        }
    }

    /// Session boundary: every owner is unloaded, and the main clients end their
    /// requests and continue on fresh engines.
    pub fn server_deactivate(&mut self) {
        self.unload_all_owners();

        for id in [self.main_cancel, self.main_forget] {
            let fresh = self.new_engine(self.config.main_client_threads);
            if let Some(client) = self.clients.get_mut(id) {
                client.end_requests();
                let old = std::mem::replace(&mut client.engine, fresh);
                self.retired.push(old);
            }
        }
        tracing::info!("server deactivated, main clients reset");
    }

    /// Removes destroyed clients and retired engines that have no request left.
    pub fn destroy_clients(&mut self) {
        let drained: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, client)| {
                client.marked_for_destruction && client.engine.active_request_count() == 0
            })
            .map(|(id, _)| id)
            .collect();

        for id in drained {
            let Some(client) = self.clients.remove(id) else {
                continue;
            };
            if let (Some(owner), Some(name)) = (client.owner, client.name) {
                self.names.remove(&(owner, name));
            }
            if let Some(twin) = client.role.twin().and_then(|twin| self.clients.get_mut(twin)) {
                twin.role = ClientRole::Standalone;
            }
            tracing::info!(client = %id, "client destroyed");
        }

        self.retired
            .retain(|engine| engine.active_request_count() > 0);
    }

    /// Ends every request, each client according to its policy, and blocks until all
    /// of them have drained. The main clients stay usable afterwards.
    pub fn shutdown(&mut self) {
        self.unload_all_owners();
        for id in [self.main_cancel, self.main_forget] {
            if let Some(client) = self.clients.get_mut(id) {
                client.end_requests();
            }
        }

        while !self.is_idle() {
            self.run_frame();
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Unloads every owner that still has clients.
    fn unload_all_owners(&mut self) {
        let owners: Vec<String> = self
            .clients
            .iter()
            .filter(|(_, client)| !client.marked_for_destruction)
            .filter_map(|(_, client)| client.owner.clone())
            .collect();
        for owner in owners {
            self.unload_owner(&owner);
        }
    }

    /// Whether no engine has work left and nothing waits for destruction.
    fn is_idle(&self) -> bool {
        self.retired.is_empty()
            && self.deliveries.borrow().is_empty()
            && self.clients.iter().all(|(_, client)| {
                client.engine.active_request_count() == 0 && !client.marked_for_destruction
            })
    }

    /// Applies a completion to its request and runs the callback.
    fn deliver(&mut self, delivery: Delivery) {
        let Delivery {
            request_id,
            ticket,
            response,
        } = delivery;
        let Some(record) = self.requests.get_mut(request_id) else {
            return;
        };
        if record.ticket != ticket {
            return;
        }
        record.response = Some(response);
        if let Some(callback) = record.callback.take() {
            callback(self, request_id);
        }
    }

    /// Request record by handle.
    fn request(&self, id: RequestId) -> Result<&RequestRecord<T>, ManagerError> {
        self.requests.get(id).ok_or(ManagerError::UnknownRequest(id))
    }

    /// Client that runs a request with these options.
    fn resolve_client(&self, options: &RequestOptions) -> Result<ClientId, ManagerError> {
        let requested = options.end_of_life_policy;
        let Some(id) = options.client else {
            return Ok(self.main_client(requested.unwrap_or_default()));
        };

        let client = self
            .clients
            .get(id)
            .ok_or(ManagerError::UnknownClient(id))?;
        if client.marked_for_destruction {
            return Err(ManagerError::ClientDestroyed(id));
        }
        let Some(requested) = requested.filter(|policy| *policy != client.policy) else {
            return Ok(id);
        };

        client
            .role
            .twin()
            .filter(|twin| {
                self.clients.get(*twin).is_some_and(|twin| {
                    twin.policy == requested && !twin.marked_for_destruction
                })
            })
            .ok_or(ManagerError::IncompatibleOptions {
                client: id,
                requested,
                actual: client.policy,
            })
    }

    /// Serial for a new client.
    fn take_client_serial(&mut self) -> u64 {
        let serial = self.next_client_serial;
        self.next_client_serial = serial.wrapping_add(1);
        serial
    }

    /// Fresh engine with the engine template and `threads` workers.
    fn new_engine(&self, threads: usize) -> RequestEngine<T> {
        RequestEngine::new(
            self.transport.clone(),
            self.clock.clone(),
            self.config.engine.with_threads(threads),
        )
    }

    /// Inserts a cancel client and its forget twin, returning both.
    fn insert_pair(
        &mut self, owner: Option<&str>, threads: usize,
    ) -> Result<(ClientId, ClientId), ManagerError> {
        let record = |manager: &mut Self, policy| {
            ClientRecord {
                owner: owner.map(str::to_string),
                name: None,
                policy,
                role: ClientRole::Standalone,
                marked_for_destruction: false,
                serial: manager.take_client_serial(),
                engine: manager.new_engine(threads),
            }
        };

        let cancel_record = record(self, EndOfLifePolicy::CancelRequests);
        let cancel = self.clients.insert(cancel_record)?;
        let forget_record = record(self, EndOfLifePolicy::ForgetRequests);
        let forget = match self.clients.insert(forget_record) {
            Ok(forget) => forget,
            Err(error) => {
                self.clients.remove(cancel);
                return Err(error.into());
            },
        };

        if let Some(client) = self.clients.get_mut(cancel) {
            client.role = ClientRole::PairedCancel { twin: forget };
        }
        if let Some(client) = self.clients.get_mut(forget) {
            client.role = ClientRole::PairedForget { twin: cancel };
        }
        tracing::info!(%cancel, %forget, owner = owner.unwrap_or("main"), "client pair created");
        Ok((cancel, forget))
    }
}

impl<T: Transport> Drop for ClientManager<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::{
        arena::{ArenaError, ArenaHandle},
        clock::ManualClock,
        response::ErrorCode,
        testing::{wait_until, StubTransport},
    };

    type Manager = ClientManager<StubTransport>;

    fn manager_with(transport: &StubTransport, config: Config) -> Manager {
        ClientManager::with_transport(
            config,
            Arc::new(transport.clone()),
            Arc::new(ManualClock::new()),
        )
        .unwrap()
    }

    fn manager(transport: &StubTransport) -> Manager {
        manager_with(transport, Config {
            main_client_threads: 2,
            ..Config::default()
        })
    }

    fn ignore(_: &mut Manager, _: RequestId) {}

    fn counting(calls: &Rc<Cell<u32>>) -> impl FnOnce(&mut Manager, RequestId) + 'static {
        let calls = calls.clone();
        move |_: &mut Manager, _: RequestId| calls.set(calls.get() + 1)
    }

    fn pump_until(manager: &mut Manager, mut done: impl FnMut(&Manager) -> bool) {
        wait_until(|| {
            manager.run_frame();
            done(manager)
        });
    }

    fn options_for(
        manager: &mut Manager, client: ClientId, policy: Option<EndOfLifePolicy>,
    ) -> OptionsId {
        let id = manager.create_options().unwrap();
        let builder = manager.options_mut(id).unwrap();
        builder.set_client(client);
        if let Some(policy) = policy {
            builder.set_end_of_life_policy(policy);
        }
        id
    }

    #[test]
    fn main_clients_always_exist() {
        let transport = StubTransport::default();
        let manager = manager(&transport);

        let cancel = manager.main_client(EndOfLifePolicy::CancelRequests);
        let forget = manager.main_client(EndOfLifePolicy::ForgetRequests);
        assert_eq!((cancel.raw(), forget.raw()), (1, 2));
        assert!(manager.client_exists(cancel));
        assert_eq!(manager.client_policy(forget), Some(EndOfLifePolicy::ForgetRequests));
    }

    #[test]
    fn response_is_delivered_to_the_callback() {
        let transport = StubTransport::default();
        let mut manager = manager(&transport);
        let seen = Rc::new(RefCell::new(None));

        let options = manager.create_options().unwrap();
        manager.options_mut(options).unwrap().set_user_data(vec![1, 2, 3]);
        let sink = seen.clone();
        let id = manager
            .send_request(RequestMethod::Get, "https://h/a", Some(options), move |m, id| {
                *sink.borrow_mut() = Some((m.response(id).unwrap().status_code, id));
            })
            .unwrap();
        assert_eq!(manager.response(id), Err(ManagerError::RequestPending(id)));

        pump_until(&mut manager, |_| seen.borrow().is_some());
        assert_eq!(*seen.borrow(), Some((200, id)));
        assert_eq!(manager.user_data(id).unwrap(), Some(&[1, 2, 3][..]));
        assert!(manager.is_request_completed(id).unwrap());
        let main = manager.main_client(EndOfLifePolicy::CancelRequests);
        assert_eq!(manager.request_client(id), Ok(Some(main)));
    }

    #[test]
    fn callback_may_delete_its_own_request() {
        let transport = StubTransport::default();
        let mut manager = manager(&transport);

        let id = manager
            .send_request(RequestMethod::Get, "https://h/a", None, |m, id| {
                assert!(m.delete_request(id, true));
            })
            .unwrap();
        pump_until(&mut manager, |m| !m.request_exists(id));
        assert!(!manager.options_exist(OptionsId::from_raw(1)));
    }

    #[test]
    fn policy_alone_picks_the_main_client() {
        let transport = StubTransport::default();
        let mut manager = manager(&transport);

        let options = manager.create_options().unwrap();
        manager
            .options_mut(options)
            .unwrap()
            .set_end_of_life_policy(EndOfLifePolicy::ForgetRequests);
        let id = manager
            .send_request(RequestMethod::Get, "https://h/a", Some(options), ignore)
            .unwrap();

        let main = manager.main_client(EndOfLifePolicy::ForgetRequests);
        assert_eq!(manager.request_client(id), Ok(Some(main)));
    }

    #[test]
    fn named_client_name_is_free_again_after_drain() {
        let transport = StubTransport::held();
        let mut manager = manager(&transport);

        let client = manager
            .create_named_client("modA", "q1", EndOfLifePolicy::CancelRequests, None)
            .unwrap();
        assert_eq!(manager.find_client("modA", "q1"), Some(client));
        assert!(matches!(
            manager.create_named_client("modA", "q1", EndOfLifePolicy::CancelRequests, None),
            Err(ManagerError::NameTaken { .. })
        ));
        assert!(manager
            .create_named_client("modB", "q1", EndOfLifePolicy::CancelRequests, None)
            .is_ok());

        let options = options_for(&mut manager, client, None);
        let request = manager
            .send_request(RequestMethod::Get, "https://h/slow", Some(options), ignore)
            .unwrap();
        wait_until(|| manager.request_progress(request).unwrap().download_now > 0);

        manager.unload_owner("modA");
        assert!(!manager.client_exists(client));
        assert_eq!(manager.find_client("modA", "q1"), None);
        assert!(matches!(
            manager.create_named_client("modA", "q1", EndOfLifePolicy::CancelRequests, None),
            Err(ManagerError::NameTaken { .. })
        ));

        pump_until(&mut manager, |m| m.client_active_requests(client).is_none());
        assert!(manager.response(request).unwrap().is_cancelled());
        assert!(manager
            .create_named_client("modA", "q1", EndOfLifePolicy::CancelRequests, None)
            .is_ok());
    }

    #[test]
    fn legacy_client_sends_forget_requests_to_its_twin() {
        let transport = StubTransport::default();
        let mut manager = manager(&transport);
        let cancel = manager.create_legacy_client("modA", None).unwrap();

        let forget_options =
            options_for(&mut manager, cancel, Some(EndOfLifePolicy::ForgetRequests));
        let forgotten = manager
            .send_request(RequestMethod::Get, "https://h/f", Some(forget_options), ignore)
            .unwrap();
        let cancel_options =
            options_for(&mut manager, cancel, Some(EndOfLifePolicy::CancelRequests));
        let cancelled = manager
            .send_request(RequestMethod::Get, "https://h/c", Some(cancel_options), ignore)
            .unwrap();

        let twin = manager.request_client(forgotten).unwrap().unwrap();
        assert_ne!(twin, cancel);
        assert_eq!(manager.client_policy(twin), Some(EndOfLifePolicy::ForgetRequests));
        assert_eq!(manager.request_client(cancelled), Ok(Some(cancel)));
    }

    #[test]
    fn request_does_not_follow_its_handle_to_a_newer_client() {
        let transport = StubTransport::held();
        let mut manager = manager(&transport);
        let client = manager
            .create_client("modA", EndOfLifePolicy::CancelRequests, Some(1))
            .unwrap();

        let options = options_for(&mut manager, client, None);
        let request = manager
            .send_request(RequestMethod::Get, "https://h/slow", Some(options), ignore)
            .unwrap();
        assert_eq!(manager.request_client(request), Ok(Some(client)));
        wait_until(|| manager.request_progress(request).unwrap().download_now > 0);

        manager.unload_owner("modA");
        pump_until(&mut manager, |m| m.client_active_requests(client).is_none());
        assert_eq!(manager.request_client(request), Ok(None));

        let newer = manager
            .create_client("modB", EndOfLifePolicy::CancelRequests, Some(1))
            .unwrap();
        assert_eq!(newer, client);
        assert_eq!(manager.request_client(request), Ok(None));
    }

    #[test]
    fn mismatched_policy_without_twin_is_refused() {
        let transport = StubTransport::default();
        let mut manager = manager(&transport);
        let client = manager
            .create_client("modA", EndOfLifePolicy::CancelRequests, Some(1))
            .unwrap();

        let options = options_for(&mut manager, client, Some(EndOfLifePolicy::ForgetRequests));
        let sent = manager.send_request(RequestMethod::Get, "https://h/a", Some(options), ignore);

        assert_eq!(sent, Err(ManagerError::IncompatibleOptions {
            client,
            requested: EndOfLifePolicy::ForgetRequests,
            actual: EndOfLifePolicy::CancelRequests,
        }));
        assert!(manager.options_mut(options).is_ok());
        assert!(!manager.request_exists(RequestId::from_raw(1)));
    }

    #[test]
    fn unknown_or_destroyed_client_is_an_error() {
        let transport = StubTransport::held();
        let mut manager = manager(&transport);

        let unknown = ClientId::from_raw(99);
        let options = options_for(&mut manager, unknown, None);
        assert_eq!(
            manager.send_request(RequestMethod::Get, "https://h/a", Some(options), ignore),
            Err(ManagerError::UnknownClient(unknown))
        );

        let client = manager
            .create_client("modA", EndOfLifePolicy::ForgetRequests, None)
            .unwrap();
        let busy = options_for(&mut manager, client, None);
        manager
            .send_request(RequestMethod::Get, "https://h/slow", Some(busy), ignore)
            .unwrap();
        manager.unload_owner("modA");

        let late = options_for(&mut manager, client, None);
        assert_eq!(
            manager.send_request(RequestMethod::Get, "https://h/b", Some(late), ignore),
            Err(ManagerError::ClientDestroyed(client))
        );

        transport.release();
        pump_until(&mut manager, |m| m.client_active_requests(client).is_none());
    }

    #[test]
    fn sent_options_are_frozen() {
        let transport = StubTransport::default();
        let mut manager = manager(&transport);
        let options = manager.create_options().unwrap();

        manager
            .send_request(RequestMethod::Get, "https://h/a", Some(options), ignore)
            .unwrap();

        assert!(matches!(manager.options_mut(options), Err(ManagerError::OptionsConsumed(_))));
        assert_eq!(
            manager.send_request(RequestMethod::Get, "https://h/a", Some(options), ignore),
            Err(ManagerError::OptionsConsumed(options))
        );
        assert!(manager.delete_options(options));
        assert_eq!(
            manager.send_request(RequestMethod::Get, "https://h/a", Some(options), ignore),
            Err(ManagerError::UnknownOptions(options))
        );
    }

    #[test]
    fn handle_exhaustion_refuses_and_recovers() {
        let transport = StubTransport::default();
        let mut manager = manager_with(&transport, Config {
            main_client_threads: 1,
            max_handle: 2,
            ..Config::default()
        });

        let first = manager
            .send_request(RequestMethod::Get, "https://h/1", None, ignore)
            .unwrap();
        manager
            .send_request(RequestMethod::Get, "https://h/2", None, ignore)
            .unwrap();
        assert_eq!(
            manager.send_request(RequestMethod::Get, "https://h/3", None, ignore),
            Err(ManagerError::HandlesExhausted(ArenaError::Exhausted(2)))
        );
        assert!(matches!(
            manager.create_client("modA", EndOfLifePolicy::CancelRequests, None),
            Err(ManagerError::HandlesExhausted(_))
        ));

        assert!(manager.delete_request(first, true));
        let reused = manager
            .send_request(RequestMethod::Get, "https://h/3", None, ignore)
            .unwrap();
        assert_eq!(reused, first);
    }

    #[test]
    fn deleted_request_never_calls_back() {
        let transport = StubTransport::held();
        let mut manager = manager(&transport);
        let calls = Rc::new(Cell::new(0));

        let id = manager
            .send_request(RequestMethod::Get, "https://h/a", None, counting(&calls))
            .unwrap();
        assert!(manager.delete_request(id, false));
        assert!(manager.cancel_request(id).is_err());

        let reused = manager
            .send_request(RequestMethod::Get, "https://h/b", None, counting(&calls))
            .unwrap();
        assert_eq!(reused, id);

        transport.release();
        pump_until(&mut manager, |m| m.response(reused).is_ok());
        assert_eq!(calls.get(), 1);
        assert_eq!(manager.response(reused).unwrap().text(), "https://h/b");
    }

    #[test]
    fn unloading_forget_client_silences_callbacks() {
        let transport = StubTransport::held();
        let mut manager = manager(&transport);
        let calls = Rc::new(Cell::new(0));

        let client = manager
            .create_client("modA", EndOfLifePolicy::ForgetRequests, None)
            .unwrap();
        let options = options_for(&mut manager, client, None);
        let id = manager
            .send_request(RequestMethod::Get, "https://h/a", Some(options), counting(&calls))
            .unwrap();

        manager.unload_owner("modA");
        assert!(!manager.is_request_cancelled(id).unwrap());
        transport.release();
        pump_until(&mut manager, |m| m.client_active_requests(client).is_none());

        assert_eq!(calls.get(), 0);
        assert_eq!(manager.response(id), Err(ManagerError::RequestPending(id)));
        assert_eq!(transport.performed().len(), 1);
    }

    #[test]
    fn server_deactivate_resets_main_clients() {
        let transport = StubTransport::held();
        let mut manager = manager(&transport);
        let user = manager
            .create_client("modA", EndOfLifePolicy::CancelRequests, None)
            .unwrap();

        let id = manager
            .send_request(RequestMethod::Get, "https://h/a", None, ignore)
            .unwrap();
        wait_until(|| manager.request_progress(id).unwrap().download_now > 0);

        manager.server_deactivate();
        assert!(manager.is_request_cancelled(id).unwrap());
        let main = manager.main_client(EndOfLifePolicy::CancelRequests);
        assert!(manager.client_exists(main));
        assert_eq!(manager.client_active_requests(main), Some(0));

        pump_until(&mut manager, |m| m.response(id).is_ok());
        let code = manager.response(id).unwrap().error_code();
        assert_eq!(code, Some(ErrorCode::RequestCancelled));
        assert!(!manager.client_exists(user));

        transport.release();
        let calls = Rc::new(Cell::new(0));
        manager
            .send_request(RequestMethod::Get, "https://h/b", None, counting(&calls))
            .unwrap();
        pump_until(&mut manager, |_| calls.get() == 1);
    }

    #[test]
    fn drop_waits_for_outstanding_requests() {
        let transport = StubTransport::default();
        let calls = Rc::new(Cell::new(0));
        {
            let mut manager = manager(&transport);
            for n in 0..4 {
                let url = format!("https://h/{n}");
                manager
                    .send_request(RequestMethod::Get, &url, None, counting(&calls))
                    .unwrap();
            }
        }
        assert_eq!(calls.get(), 4);
    }
}
