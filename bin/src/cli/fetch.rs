//! Fetch cli command

use std::{
    cell::RefCell,
    collections::HashMap,
    fs,
    io::{self, Write},
    path::PathBuf,
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use anyhow::{anyhow, bail, Context};
use clap::Args;
use ezhttp::{
    ClientManager, Config, EndOfLifePolicy, OptionsBuilder, RequestId, RequestMethod, Response,
    TransferError,
};

/// Owner of the client the command sends through.
const OWNER: &str = "cli";

/// Fetch cli command
#[derive(Args)]
pub(crate) struct FetchCommand {
    /// URLs to request, all sent at once
    #[clap(required = true)]
    urls: Vec<String>,

    /// Request method
    #[clap(short = 'X', long, value_enum, default_value_t = RequestMethod::Get)]
    method: RequestMethod,

    /// Request header, `Name: value`
    #[clap(short = 'H', long = "header", value_parser = parse_header)]
    headers: Vec<(String, String)>,

    /// Request body
    #[clap(short = 'd', long = "data")]
    body: Option<String>,

    /// Form field, `key=value`
    #[clap(short = 'F', long = "form", value_parser = parse_pair)]
    form: Vec<(String, String)>,

    /// Query parameter, `key=value`
    #[clap(short = 'q', long = "query", value_parser = parse_pair)]
    query: Vec<(String, String)>,

    /// Cookie, `name=value`
    #[clap(long = "cookie", value_parser = parse_pair)]
    cookies: Vec<(String, String)>,

    /// `User-Agent` header
    #[clap(short = 'A', long)]
    user_agent: Option<String>,

    /// Basic authentication, `user:password`
    #[clap(short = 'u', long = "user", value_parser = parse_credentials)]
    auth: Option<(String, String)>,

    /// Proxy URL
    #[clap(long)]
    proxy: Option<String>,

    /// Proxy credentials, `user:password`
    #[clap(long, value_parser = parse_credentials)]
    proxy_user: Option<(String, String)>,

    /// Whole transfer timeout in seconds
    #[clap(long)]
    timeout: Option<u64>,

    /// Connect timeout in seconds
    #[clap(long)]
    connect_timeout: Option<u64>,

    /// Refuse plain-text http
    #[clap(long, action = clap::ArgAction::SetTrue)]
    secure: bool,

    /// Stream the response body into this file (single URL only)
    #[clap(short = 'o', long, conflicts_with = "upload_file")]
    output: Option<PathBuf>,

    /// Stream this file as the request body (single URL only)
    #[clap(short = 'T', long)]
    upload_file: Option<PathBuf>,

    /// What happens to the requests on Ctrl-C
    #[clap(long, value_enum, default_value_t = EndOfLifePolicy::CancelRequests)]
    policy: EndOfLifePolicy,

    /// Worker threads of the client, defaults to the number of CPUs (at most 6)
    #[clap(long)]
    threads: Option<usize>,

    /// Tick interval in milliseconds
    #[clap(long, default_value_t = 10)]
    tick_ms: u64,

    /// Extra PEM root certificate
    #[clap(long)]
    ca_cert: Option<PathBuf>,

    /// JSON configuration file, flags override it
    #[clap(long)]
    config: Option<PathBuf>,
}

/// Outcome of one request as printed.
#[derive(serde::Serialize)]
struct Report<'a> {
    /// Request handle.
    request: RequestId,
    /// Effective URL.
    url: &'a str,
    /// HTTP status.
    status: u16,
    /// Reason phrase.
    reason: &'a str,
    /// Transfer time.
    elapsed_ms: u64,
    /// Transfer error.
    error: Option<&'a TransferError>,
    /// Response headers.
    headers: &'a HashMap<String, String>,
    /// Cookies set by the response.
    cookies: &'a HashMap<String, String>,
    /// Body, omitted when it went to a file.
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<String>,
    /// Bytes sent.
    uploaded_bytes: u64,
    /// Bytes received.
    downloaded_bytes: u64,
    /// Redirects followed.
    redirect_count: u32,
}

impl<'a> Report<'a> {
    /// Report of a delivered response.
    fn new(request: RequestId, response: &'a Response, with_body: bool) -> Self {
        Self {
            request,
            url: &response.url,
            status: response.status_code,
            reason: &response.reason,
            elapsed_ms: u64::try_from(response.elapsed.as_millis()).unwrap_or(u64::MAX),
            error: response.error.as_ref(),
            headers: &response.headers,
            cookies: &response.cookies,
            body: with_body.then(|| response.text().into_owned()),
            uploaded_bytes: response.uploaded_bytes,
            downloaded_bytes: response.downloaded_bytes,
            redirect_count: response.redirect_count,
        }
    }
}

/// Printed line and whether the request failed.
type Outcome = (anyhow::Result<String>, bool);

/// How a run ended.
#[derive(Debug, Default, PartialEq, Eq)]
struct Summary {
    /// Responses printed.
    printed: usize,
    /// Printed responses that carry an error or an error status.
    failed: usize,
    /// Requests dropped without a response by the `forget-requests` policy.
    forgotten: usize,
}

impl FetchCommand {
    /// Run the requests
    pub(crate) fn exec(self) -> anyhow::Result<()> {
        let interrupted = Arc::new(AtomicBool::new(false));
        let flag = interrupted.clone();
        ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))?;

        let summary = self.run(&interrupted, &mut io::stdout().lock())?;
        if summary.forgotten > 0 {
            bail!("interrupted, {} requests forgotten", summary.forgotten);
        }
        if summary.failed > 0 {
            bail!("{} of {} requests failed", summary.failed, self.urls.len());
        }
        Ok(())
    }

    /// Sends every URL and prints the responses to `out` as they arrive. Once
    /// `interrupted` is raised the client is unloaded, and `--policy` decides whether
    /// the pending requests report a cancellation or are dropped.
    fn run(&self, interrupted: &AtomicBool, out: &mut impl Write) -> anyhow::Result<Summary> {
        if self.urls.len() > 1 && (self.output.is_some() || self.upload_file.is_some()) {
            bail!("--output and --upload-file take a single URL");
        }

        let mut manager = ClientManager::new(self.load_config()?)?;
        let threads = self
            .threads
            .unwrap_or_else(|| num_cpus::get().clamp(1, 6));
        let client = manager.create_client(OWNER, self.policy, Some(threads))?;

        let method = self.effective_method();
        let outcomes: Rc<RefCell<Vec<Outcome>>> = Rc::default();
        let mut sent = 0;
        for url in &self.urls {
            let options = manager.create_options()?;
            self.apply(manager.options_mut(options)?);
            manager.options_mut(options)?.set_client(client);

            let outcomes = outcomes.clone();
            let with_body = self.output.is_none();
            manager.send_request(method, url, Some(options), move |m, id| {
                let outcome = match m.response(id) {
                    Ok(response) => {
                        let failed = response.error.is_some() || response.status_code >= 400;
                        let line = serde_json::to_string(&Report::new(id, response, with_body))
                            .map_err(anyhow::Error::from);
                        (line, failed)
                    },
                    Err(err) => (Err(err.into()), true),
                };
                outcomes.borrow_mut().push(outcome);
                m.delete_request(id, true);
            })?;
            sent += 1;
        }

        let tick = Duration::from_millis(self.tick_ms.max(1));
        let mut summary = Summary::default();
        let mut unloaded = false;
        while summary.printed < sent {
            manager.run_frame();

            for (line, request_failed) in outcomes.borrow_mut().drain(..) {
                writeln!(out, "{}", line?)?;
                summary.printed += 1;
                summary.failed += usize::from(request_failed);
            }

            if !unloaded && interrupted.load(Ordering::SeqCst) {
                let pending = sent.saturating_sub(summary.printed);
                tracing::warn!(policy = ?self.policy, pending, "interrupted");
                manager.unload_owner(OWNER);
                unloaded = true;
                if self.policy == EndOfLifePolicy::ForgetRequests {
                    summary.forgotten = pending;
                    break;
                }
            }
            if summary.printed < sent {
                thread::sleep(tick);
            }
        }

        if !unloaded {
            manager.unload_owner(OWNER);
        }
        Ok(summary)
    }

    /// Configuration file, if any, with the flags applied on top.
    fn load_config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
            },
            None => Config::default(),
        };
        if let Some(ca_cert) = &self.ca_cert {
            config.ca_cert_path = Some(ca_cert.clone());
        }
        Ok(config)
    }

    /// File transfers turn the method into an upload or download.
    fn effective_method(&self) -> RequestMethod {
        if self.output.is_some() {
            RequestMethod::FtpDownload
        } else if self.upload_file.is_some() {
            RequestMethod::FtpUpload
        } else {
            self.method
        }
    }

    /// Copies the flags onto request options.
    fn apply(&self, builder: &mut OptionsBuilder) {
        for (key, value) in &self.headers {
            builder.set_header(key, value);
        }
        for (key, value) in &self.form {
            builder.add_form_payload(key, value);
        }
        for (key, value) in &self.query {
            builder.add_url_parameter(key, value);
        }
        for (name, value) in &self.cookies {
            builder.set_cookie(name, value);
        }
        if let Some(body) = &self.body {
            builder.set_body(body);
        }
        if let Some(user_agent) = &self.user_agent {
            builder.set_user_agent(user_agent);
        }
        if let Some((user, password)) = &self.auth {
            builder.set_auth(user, password);
        }
        if let Some(proxy) = &self.proxy {
            builder.set_proxy(proxy);
        }
        if let Some((user, password)) = &self.proxy_user {
            builder.set_proxy_auth(user, password);
        }
        if let Some(timeout) = self.timeout {
            builder.set_timeout(Duration::from_secs(timeout));
        }
        if let Some(timeout) = self.connect_timeout {
            builder.set_connect_timeout(Duration::from_secs(timeout));
        }
        if let Some(path) = self.output.as_ref().or(self.upload_file.as_ref()) {
            builder.set_file_path(path.display().to_string());
        }
        builder
            .set_secure(self.secure)
            .set_end_of_life_policy(self.policy);
    }
}

/// Parses `Name: value`.
fn parse_header(arg: &str) -> anyhow::Result<(String, String)> {
    let (name, value) = arg
        .split_once(':')
        .ok_or_else(|| anyhow!("expected `Name: value`, got `{arg}`"))?;
    Ok((name.trim().to_string(), value.trim().to_string()))
}

/// Parses `key=value`.
fn parse_pair(arg: &str) -> anyhow::Result<(String, String)> {
    let (key, value) = arg
        .split_once('=')
        .ok_or_else(|| anyhow!("expected `key=value`, got `{arg}`"))?;
    Ok((key.to_string(), value.to_string()))
}

/// Parses `user:password`.
fn parse_credentials(arg: &str) -> anyhow::Result<(String, String)> {
    let (user, password) = arg.split_once(':').unwrap_or((arg, ""));
    Ok((user.to_string(), password.to_string()))
}
