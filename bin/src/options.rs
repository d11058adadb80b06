//! Request options and their builder.

use std::{collections::BTreeMap, time::Duration};

use crate::arena::ClientId;

/// Method of a request.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum RequestMethod {
    /// `GET`
    Get,
    /// `POST`
    Post,
    /// `PUT`
    Put,
    /// `PATCH`
    Patch,
    /// `DELETE`
    Delete,
    /// Upload the file at the options' file path.
    FtpUpload,
    /// Download into the file at the options' file path.
    FtpDownload,
}

impl RequestMethod {
    /// Whether the transfer streams from or into a file instead of memory.
    #[must_use]
    pub fn is_file_transfer(self) -> bool {
        matches!(self, Self::FtpUpload | Self::FtpDownload)
    }
}

/// What happens to in-flight requests when their owner goes away.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    serde::Serialize,
    serde::Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum EndOfLifePolicy {
    /// Transfers are aborted, callbacks still report the cancellation.
    #[default]
    CancelRequests,
    /// Transfers run to completion, callbacks never fire.
    ForgetRequests,
}

/// Basic credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// User name.
    pub user: String,
    /// Password.
    pub password: String,
}

/// Everything a transfer needs besides its method and URL. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// `User-Agent` header.
    pub user_agent: Option<String>,
    /// Query string parameters, in insertion order.
    pub url_parameters: Vec<(String, String)>,
    /// `application/x-www-form-urlencoded` fields, in insertion order.
    pub form_payload: Vec<(String, String)>,
    /// Raw request body.
    pub body: Option<String>,
    /// Request headers.
    pub headers: BTreeMap<String, String>,
    /// Cookies sent with the request, unique by name.
    pub cookies: Vec<(String, String)>,
    /// Whole transfer timeout.
    pub timeout: Option<Duration>,
    /// Connection phase timeout.
    pub connect_timeout: Option<Duration>,
    /// Proxy URL.
    pub proxy_url: Option<String>,
    /// Proxy credentials.
    pub proxy_auth: Option<Credentials>,
    /// Basic authentication.
    pub auth: Option<Credentials>,
    /// Refuse plain-text transfers.
    pub require_secure: bool,
    /// Source or destination of a file transfer.
    pub file_path: Option<String>,
    /// Opaque caller data handed back with the response.
    pub user_data: Option<Vec<u8>>,
    /// Requested end-of-life policy, the target client's own policy when unset.
    pub end_of_life_policy: Option<EndOfLifePolicy>,
    /// Requested client, one of the main clients when unset.
    pub client: Option<ClientId>,
}

/// Incremental builder for [`RequestOptions`].
#[derive(Debug, Clone, Default)]
pub struct OptionsBuilder {
    /// Options under construction.
    options: RequestOptions,
}

impl OptionsBuilder {
    /// Starts from empty options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the `User-Agent` header.
    pub fn set_user_agent(&mut self, user_agent: impl Into<String>) -> &mut Self {
        self.options.user_agent = Some(user_agent.into());
        self
    }

    /// Appends a query parameter.
    pub fn add_url_parameter(
        &mut self, key: impl Into<String>, value: impl Into<String>,
    ) -> &mut Self {
        self.options.url_parameters.push((key.into(), value.into()));
        self
    }

    /// Appends a form field.
    pub fn add_form_payload(
        &mut self, key: impl Into<String>, value: impl Into<String>,
    ) -> &mut Self {
        self.options.form_payload.push((key.into(), value.into()));
        self
    }

    /// Replaces the body.
    pub fn set_body(&mut self, body: impl Into<String>) -> &mut Self {
        self.options.body = Some(body.into());
        self
    }

    /// Appends to the body, starting one if there is none.
    pub fn append_body(&mut self, chunk: &str) -> &mut Self {
        self.options
            .body
            .get_or_insert_with(String::new)
            .push_str(chunk);
        self
    }

    /// Sets a header, replacing a previous value for the same key.
    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.options.headers.insert(key.into(), value.into());
        self
    }

    /// Sets a cookie. A cookie with the same name keeps its position and gets the new
    /// value.
    pub fn set_cookie(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let name = name.into();
        let value = value.into();
        match self.options.cookies.iter_mut().find(|(n, _)| *n == name) {
            Some(cookie) => cookie.1 = value,
            None => self.options.cookies.push((name, value)),
        }
        self
    }

    /// Sets the whole transfer timeout.
    pub fn set_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.options.timeout = Some(timeout);
        self
    }

    /// Sets the connect timeout.
    pub fn set_connect_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.options.connect_timeout = Some(timeout);
        self
    }

    /// Routes the request through a proxy.
    pub fn set_proxy(&mut self, proxy_url: impl Into<String>) -> &mut Self {
        self.options.proxy_url = Some(proxy_url.into());
        self
    }

    /// Sets proxy credentials.
    pub fn set_proxy_auth(
        &mut self, user: impl Into<String>, password: impl Into<String>,
    ) -> &mut Self {
        self.options.proxy_auth = Some(Credentials {
            user: user.into(),
            password: password.into(),
        });
        self
    }

    /// Sets basic authentication.
    pub fn set_auth(&mut self, user: impl Into<String>, password: impl Into<String>) -> &mut Self {
        self.options.auth = Some(Credentials {
            user: user.into(),
            password: password.into(),
        });
        self
    }

    /// Requires TLS.
    pub fn set_secure(&mut self, secure: bool) -> &mut Self {
        self.options.require_secure = secure;
        self
    }

    /// Sets the file used by upload and download methods.
    pub fn set_file_path(&mut self, file_path: impl Into<String>) -> &mut Self {
        self.options.file_path = Some(file_path.into());
        self
    }

    /// Attaches opaque caller data.
    pub fn set_user_data(&mut self, user_data: impl Into<Vec<u8>>) -> &mut Self {
        self.options.user_data = Some(user_data.into());
        self
    }

    /// Requests an end-of-life policy.
    pub fn set_end_of_life_policy(&mut self, policy: EndOfLifePolicy) -> &mut Self {
        self.options.end_of_life_policy = Some(policy);
        self
    }

    /// Targets a specific client.
    pub fn set_client(&mut self, client: ClientId) -> &mut Self {
        self.options.client = Some(client);
        self
    }

    /// Options built so far.
    #[must_use]
    pub fn options(&self) -> &RequestOptions {
        &self.options
    }

    /// Finishes the options.
    #[must_use]
    pub fn build(self) -> RequestOptions {
        self.options
    }
}
