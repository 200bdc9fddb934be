//! Request building and the expired-token retry.

use http::header::{CONTENT_TYPE, USER_AGENT};
use http::{HeaderName, HeaderValue, Method, Request, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use smol_str::SmolStr;
use tern_common::error::{ClientError, ClientResult, DecodeError, HttpError, TransportError};
use tern_common::http_client::HttpClient;
use url::Url;

use crate::credential::CredentialAgent;
use crate::oauth::OAuthAgent;

/// The agent a [`RequestBuilder`] signs with.
pub(crate) enum Signer<'a, C> {
    Credential(&'a CredentialAgent<C>),
    OAuth(&'a OAuthAgent<C>),
}

impl<C: HttpClient + Sync> Signer<'_, C> {
    async fn pds(&self) -> Option<SmolStr> {
        match self {
            Self::Credential(agent) => agent.pds().await,
            Self::OAuth(agent) => agent.pds().await,
        }
    }

    fn user_agent(&self) -> &str {
        match self {
            Self::Credential(agent) => &agent.options().user_agent,
            Self::OAuth(agent) => &agent.options().user_agent,
        }
    }

    async fn access_token(&self) -> ClientResult<SmolStr> {
        match self {
            Self::Credential(agent) => agent.access_token().await,
            Self::OAuth(agent) => agent.access_token().await,
        }
    }

    async fn refresh_after_rejection(&self, rejected: &str) -> ClientResult<SmolStr> {
        match self {
            Self::Credential(agent) => agent.refresh_after_rejection(rejected).await,
            Self::OAuth(agent) => agent.refresh_after_rejection(rejected).await,
        }
    }

    async fn send(
        &self,
        request: Request<Vec<u8>>,
        token: Option<&str>,
    ) -> ClientResult<Response<Vec<u8>>> {
        match self {
            Self::Credential(agent) => agent.send(request, token).await,
            Self::OAuth(agent) => agent.send(request, token).await,
        }
    }
}

enum Target {
    /// `{pds}/xrpc/{nsid}`, resolved against the session at send time
    Xrpc(SmolStr),
    Url(Url),
}

/// One request through an agent.
///
/// With `require_auth`, the agent's access token is attached (refreshing it
/// first if it has expired), and a response saying the token expired causes
/// one refresh and one retry. Without it, the request goes out unsigned.
///
/// ```no_run
/// # async fn demo<C: tern::HttpClient + Sync>(agent: &tern::Agent<C>) -> tern::ClientResult<()> {
/// let profile: serde_json::Value = agent
///     .http(true)
///     .query("app.bsky.actor.getProfile")
///     .param("actor", "alice.bsky.social")
///     .send_json()
///     .await?;
/// # Ok(()) }
/// ```
#[must_use = "requests do nothing until sent"]
pub struct RequestBuilder<'a, C> {
    signer: Signer<'a, C>,
    require_auth: bool,
    method: Method,
    target: Option<Target>,
    query: Vec<(String, String)>,
    headers: Vec<(HeaderName, HeaderValue)>,
    body: Vec<u8>,
    error: Option<ClientError>,
}

impl<'a, C: HttpClient + Sync> RequestBuilder<'a, C> {
    pub(crate) fn new(signer: Signer<'a, C>, require_auth: bool) -> Self {
        Self {
            signer,
            require_auth,
            method: Method::GET,
            target: None,
            query: Vec::new(),
            headers: Vec::new(),
            body: Vec::new(),
            error: None,
        }
    }

    /// XRPC query (`GET`) on the session's PDS.
    pub fn query(mut self, nsid: impl Into<SmolStr>) -> Self {
        self.method = Method::GET;
        self.target = Some(Target::Xrpc(nsid.into()));
        self
    }

    /// XRPC procedure (`POST`) on the session's PDS.
    pub fn procedure(mut self, nsid: impl Into<SmolStr>) -> Self {
        self.method = Method::POST;
        self.target = Some(Target::Xrpc(nsid.into()));
        self
    }

    /// Arbitrary method and absolute URL.
    pub fn request(mut self, method: Method, url: Url) -> Self {
        self.method = method;
        self.target = Some(Target::Url(url));
        self
    }

    pub fn get(self, url: Url) -> Self {
        self.request(Method::GET, url)
    }

    pub fn post(self, url: Url) -> Self {
        self.request(Method::POST, url)
    }

    /// Append one query parameter.
    pub fn param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((name.into(), value.to_string()));
        self
    }

    /// Append every field of `params` as query parameters.
    pub fn params<P: Serialize + ?Sized>(mut self, params: &P) -> Self {
        match serde_html_form::to_string(params) {
            Ok(qs) => self
                .query
                .extend(url::form_urlencoded::parse(qs.as_bytes()).into_owned()),
            Err(e) => self.fail(TransportError::InvalidRequest(e.to_string())),
        }
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.push((name, value));
        self
    }

    /// JSON body with `Content-Type: application/json`.
    pub fn json<B: Serialize + ?Sized>(mut self, body: &B) -> Self {
        match serde_json::to_vec(body) {
            Ok(bytes) => {
                self.body = bytes;
                self.headers.push((
                    CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                ));
            }
            Err(e) => self.fail(TransportError::InvalidRequest(e.to_string())),
        }
        self
    }

    /// Raw body, e.g. a blob upload.
    pub fn body(mut self, content_type: HeaderValue, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self.headers.push((CONTENT_TYPE, content_type));
        self
    }

    fn fail(&mut self, error: impl Into<ClientError>) {
        self.error.get_or_insert(error.into());
    }

    /// Send, returning the response if its status is a success.
    ///
    /// Any other status becomes [`ClientError::Http`].
    pub async fn send(mut self) -> ClientResult<Response<Vec<u8>>> {
        if let Some(error) = self.error.take() {
            return Err(error);
        }
        if !self.require_auth {
            let url = self.url().await?;
            let response = self.signer.send(self.build(&url)?, None).await?;
            return check(response);
        }

        // a refresh may move the session to another PDS
        let token = self.signer.access_token().await?;
        let url = self.url().await?;
        let response = self.signer.send(self.build(&url)?, Some(&token)).await?;
        if response.status().is_success() || !HttpError::from_response(&response).is_token_expired()
        {
            return check(response);
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(%url, status = %response.status(), "access token rejected, refreshing");
        let token = self.signer.refresh_after_rejection(&token).await?;
        let response = self.signer.send(self.build(&url)?, Some(&token)).await?;
        check(response)
    }

    /// Send and decode a JSON response body.
    pub async fn send_json<T: DeserializeOwned>(self) -> ClientResult<T> {
        let response = self.send().await?;
        Ok(serde_json::from_slice(response.body()).map_err(DecodeError::from)?)
    }

    async fn url(&self) -> ClientResult<Url> {
        let mut url = match &self.target {
            Some(Target::Url(url)) => url.clone(),
            Some(Target::Xrpc(nsid)) => {
                let pds = self.signer.pds().await.ok_or_else(|| {
                    TransportError::InvalidRequest("session has no PDS endpoint".into())
                })?;
                xrpc_url(&pds, nsid)?
            }
            None => {
                return Err(TransportError::InvalidRequest("request has no target".into()).into());
            }
        };
        if !self.query.is_empty() {
            url.query_pairs_mut().extend_pairs(&self.query);
        }
        Ok(url)
    }

    fn build(&self, url: &Url) -> Result<Request<Vec<u8>>, TransportError> {
        let mut builder = Request::builder()
            .method(self.method.clone())
            .uri(url.as_str())
            .header(USER_AGENT, self.signer.user_agent());
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }
        Ok(builder.body(self.body.clone())?)
    }
}

/// `{base}/xrpc/{nsid}`.
pub(crate) fn xrpc_url(base: &str, nsid: &str) -> Result<Url, TransportError> {
    Url::parse(&format!("{}/xrpc/{nsid}", base.trim_end_matches('/')))
        .map_err(|e| TransportError::InvalidRequest(format!("invalid PDS URL {base}: {e}")))
}

pub(crate) fn check(response: Response<Vec<u8>>) -> ClientResult<Response<Vec<u8>>> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(HttpError::from_response(&response).into())
    }
}
