use std::sync::RwLock;

use async_trait::async_trait;
use reqwest::{header, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::{
    core::redact_url,
    error::ClientError,
    model::{
        AuthResultWire, Conversation, ConversationWire, CredentialCheck, Credentials,
        LoginFlowWire, LoginPoll, LoginTicket, OcsEnvelope, Reply,
    },
    USER_AGENT,
};

const USER_STATUS_PATH: &str = "/ocs/v2.php/apps/user_status/api/v1/user_status";
const LOGIN_FLOW_PATH: &str = "/index.php/login/v2";
const ROOMS_PATH: &str = "/ocs/v2.php/apps/spreed/api/v4/room";

/// Typed access to one instance's API surface.
#[async_trait]
pub(crate) trait RemoteApi: Send + Sync {
    fn base_url(&self) -> &str;

    fn credentials(&self) -> Credentials;

    fn set_credentials(&self, credentials: Credentials);

    /// An empty login name is [`CredentialCheck::Invalid`] and never hits the network.
    async fn validate_credentials(&self, credentials: &Credentials) -> Reply<CredentialCheck>;

    /// Initiates a browser handshake. `None` unless the reply is a success.
    async fn start_login(&self) -> Reply<Option<LoginTicket>>;

    async fn poll_login(&self, ticket: &LoginTicket) -> LoginPoll;

    /// The only call that can report `LoginExpired`.
    async fn fetch_conversations(&self) -> Reply<Vec<Conversation>>;
}

pub(crate) struct HttpRemote {
    client: reqwest::Client,
    base_url: String,
    credentials: RwLock<Credentials>,
}

impl HttpRemote {
    pub(crate) fn new(base_url: &str, credentials: Credentials) -> Result<Self, ClientError> {
        let trimmed = base_url.trim().trim_end_matches('/');
        let parsed =
            reqwest::Url::parse(trimmed).map_err(|error| ClientError::InvalidUrl(error.to_string()))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(ClientError::InvalidUrl(format!(
                "unsupported scheme {}",
                parsed.scheme()
            )));
        }

        let client = reqwest::Client::builder().user_agent(USER_AGENT).build()?;

        Ok(Self {
            client,
            base_url: trimmed.to_string(),
            credentials: RwLock::new(credentials),
        })
    }

    fn ocs_get(&self, path: &str, credentials: &Credentials) -> RequestBuilder {
        self.client
            .get(format!("{}{path}", self.base_url))
            .header("OCS-APIRequest", "true")
            .header(header::ACCEPT, "application/json")
            .basic_auth(&credentials.login_name, Some(&credentials.app_password))
    }
}

async fn decode_body<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
    let body = response.text().await?;
    Ok(serde_json::from_str(&body)?)
}

#[async_trait]
impl RemoteApi for HttpRemote {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn credentials(&self) -> Credentials {
        self.credentials
            .read()
            .map(|credentials| credentials.clone())
            .unwrap_or_default()
    }

    fn set_credentials(&self, credentials: Credentials) {
        match self.credentials.write() {
            Ok(mut slot) => *slot = credentials,
            Err(poisoned) => *poisoned.into_inner() = credentials,
        }
    }

    async fn validate_credentials(&self, credentials: &Credentials) -> Reply<CredentialCheck> {
        if credentials.is_empty() {
            return Reply::success(CredentialCheck::Invalid);
        }

        let response = match self.ocs_get(USER_STATUS_PATH, credentials).send().await {
            Ok(response) => response,
            Err(error) => return Reply::unreachable(CredentialCheck::ValidationFailed, error.into()),
        };

        let status = response.status();
        debug!(status = status.as_u16(), "credential validation response");
        if status == StatusCode::UNAUTHORIZED {
            return Reply::success(CredentialCheck::Expired);
        }
        if status == StatusCode::SERVICE_UNAVAILABLE {
            return Reply::maintenance(CredentialCheck::ValidationFailed);
        }
        if !status.is_success() {
            return Reply::unreachable(
                CredentialCheck::ValidationFailed,
                ClientError::UnexpectedStatus(status.as_u16()),
            );
        }

        match decode_body::<OcsEnvelope<serde_json::Value>>(response).await {
            Ok(envelope) if envelope.ocs.meta.status == "ok" => {
                Reply::success(CredentialCheck::Valid)
            }
            Ok(_) => Reply::success(CredentialCheck::Expired),
            Err(error) => Reply::unreachable(CredentialCheck::ValidationFailed, error),
        }
    }

    async fn start_login(&self) -> Reply<Option<LoginTicket>> {
        let response = match self
            .client
            .post(format!("{}{LOGIN_FLOW_PATH}", self.base_url))
            .send()
            .await
        {
            Ok(response) => response,
            Err(error) => return Reply::unreachable(None, error.into()),
        };

        let status = response.status();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            return Reply::maintenance(None);
        }
        if !status.is_success() {
            return Reply::unreachable(None, ClientError::UnexpectedStatus(status.as_u16()));
        }

        match decode_body::<LoginFlowWire>(response).await {
            Ok(flow) => {
                debug!(endpoint = %redact_url(&flow.poll.endpoint), "login handshake initiated");
                Reply::success(Some(LoginTicket {
                    poll_endpoint: flow.poll.endpoint,
                    poll_token: flow.poll.token,
                    login_url: flow.login,
                }))
            }
            Err(error) => Reply::unreachable(None, error),
        }
    }

    async fn poll_login(&self, ticket: &LoginTicket) -> LoginPoll {
        let response = match self
            .client
            .post(&ticket.poll_endpoint)
            .form(&[("token", ticket.poll_token.as_str())])
            .send()
            .await
        {
            Ok(response) => response,
            Err(error) => return LoginPoll::Error(error.into()),
        };

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return LoginPoll::Pending;
        }
        if status == StatusCode::SERVICE_UNAVAILABLE {
            return LoginPoll::Maintenance;
        }
        if !status.is_success() {
            return LoginPoll::Error(ClientError::UnexpectedStatus(status.as_u16()));
        }

        match decode_body::<AuthResultWire>(response).await {
            Ok(auth) => LoginPoll::Completed(Credentials::new(auth.login_name, auth.app_password)),
            Err(error) => LoginPoll::Error(error),
        }
    }

    async fn fetch_conversations(&self) -> Reply<Vec<Conversation>> {
        let credentials = self.credentials();
        let response = match self.ocs_get(ROOMS_PATH, &credentials).send().await {
            Ok(response) => response,
            Err(error) => return Reply::unreachable(Vec::new(), error.into()),
        };

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Reply::login_expired(Vec::new());
        }
        if !status.is_success() {
            return Reply::unreachable(Vec::new(), ClientError::UnexpectedStatus(status.as_u16()));
        }

        match decode_body::<OcsEnvelope<Vec<ConversationWire>>>(response).await {
            Ok(envelope) => {
                Reply::success(envelope.ocs.data.into_iter().map(Conversation::from).collect())
            }
            Err(error) => Reply::unreachable(Vec::new(), error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TransportOutcome;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn remote(server: &MockServer) -> HttpRemote {
        HttpRemote::new(&server.uri(), Credentials::new("alice", "secret")).unwrap()
    }

    fn ocs(status: &str, data: serde_json::Value) -> serde_json::Value {
        serde_json::json!({
            "ocs": {
                "meta": {"status": status, "statuscode": 200, "message": "OK"},
                "data": data
            }
        })
    }

    #[test]
    fn rejects_non_http_base_url() {
        assert!(HttpRemote::new("ftp://cloud.example.com", Credentials::default()).is_err());
        assert!(HttpRemote::new("not a url", Credentials::default()).is_err());
    }

    #[test]
    fn trims_trailing_slash() {
        let remote = HttpRemote::new("https://cloud.example.com/", Credentials::default()).unwrap();
        assert_eq!(remote.base_url(), "https://cloud.example.com");
    }

    #[tokio::test]
    async fn empty_login_name_is_invalid_without_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let reply = remote(&server)
            .validate_credentials(&Credentials::new("", "whatever"))
            .await;

        assert_eq!(reply.value, CredentialCheck::Invalid);
        assert_eq!(reply.transport, TransportOutcome::Success);
        assert!(reply.error.is_none());
    }

    #[tokio::test]
    async fn validation_sends_ocs_headers_and_basic_auth() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(USER_STATUS_PATH))
            .and(header("OCS-APIRequest", "true"))
            .and(header("authorization", "Basic YWxpY2U6c2VjcmV0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ocs("ok", serde_json::json!({}))))
            .expect(1)
            .mount(&server)
            .await;

        let reply = remote(&server)
            .validate_credentials(&Credentials::new("alice", "secret"))
            .await;

        assert_eq!(reply.value, CredentialCheck::Valid);
        assert_eq!(reply.transport, TransportOutcome::Success);
    }

    #[tokio::test]
    async fn validation_status_mapping() {
        let cases = [
            (401, CredentialCheck::Expired, TransportOutcome::Success, false),
            (503, CredentialCheck::ValidationFailed, TransportOutcome::Maintenance, false),
            (500, CredentialCheck::ValidationFailed, TransportOutcome::Unreachable, true),
            (403, CredentialCheck::ValidationFailed, TransportOutcome::Unreachable, true),
        ];

        for (status, check, transport, has_error) in cases {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path(USER_STATUS_PATH))
                .respond_with(ResponseTemplate::new(status))
                .mount(&server)
                .await;

            let reply = remote(&server)
                .validate_credentials(&Credentials::new("alice", "secret"))
                .await;

            assert_eq!(reply.value, check, "HTTP {status}");
            assert_eq!(reply.transport, transport, "HTTP {status}");
            assert_eq!(reply.error.is_some(), has_error, "HTTP {status}");
        }
    }

    #[tokio::test]
    async fn validation_non_ok_status_field_means_expired() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(USER_STATUS_PATH))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(ocs("failure", serde_json::json!({}))),
            )
            .mount(&server)
            .await;

        let reply = remote(&server)
            .validate_credentials(&Credentials::new("alice", "secret"))
            .await;

        assert_eq!(reply.value, CredentialCheck::Expired);
        assert_eq!(reply.transport, TransportOutcome::Success);
    }

    #[tokio::test]
    async fn validation_decode_failure_is_unreachable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(USER_STATUS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>login</html>"))
            .mount(&server)
            .await;

        let reply = remote(&server)
            .validate_credentials(&Credentials::new("alice", "secret"))
            .await;

        assert_eq!(reply.value, CredentialCheck::ValidationFailed);
        assert_eq!(reply.transport, TransportOutcome::Unreachable);
        assert!(matches!(reply.error, Some(ClientError::Decode(_))));
    }

    #[tokio::test]
    async fn fetch_401_is_login_expired() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(ROOMS_PATH))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let reply = remote(&server).fetch_conversations().await;

        assert_eq!(reply.transport, TransportOutcome::LoginExpired);
        assert!(reply.value.is_empty());
        assert!(reply.error.is_none());
    }

    #[tokio::test]
    async fn fetch_other_failures_are_unreachable() {
        for status in [500, 503, 404] {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path(ROOMS_PATH))
                .respond_with(ResponseTemplate::new(status))
                .mount(&server)
                .await;

            let reply = remote(&server).fetch_conversations().await;

            assert_eq!(reply.transport, TransportOutcome::Unreachable, "HTTP {status}");
            assert!(matches!(reply.error, Some(ClientError::UnexpectedStatus(s)) if s == status));
        }
    }

    #[tokio::test]
    async fn fetch_decodes_conversations_with_current_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(ROOMS_PATH))
            .and(header("authorization", "Basic YWxpY2U6c2VjcmV0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ocs(
                "ok",
                serde_json::json!([{
                    "id": 42,
                    "type": 1,
                    "displayName": "Bob",
                    "unreadMessages": 3,
                    "notificationLevel": 0,
                    "lastMessage": {"id": 7, "token": "t0k", "actorType": "users", "actorId": "bob", "message": "hi"}
                }]),
            )))
            .mount(&server)
            .await;

        let remote = HttpRemote::new(&server.uri(), Credentials::default()).unwrap();
        remote.set_credentials(Credentials::new("alice", "secret"));
        let reply = remote.fetch_conversations().await;

        assert_eq!(reply.transport, TransportOutcome::Success);
        assert_eq!(reply.value.len(), 1);
        assert_eq!(reply.value[0].id, 42);
        assert_eq!(reply.value[0].last_message.id, 7);
    }

    #[tokio::test]
    async fn start_login_503_is_maintenance() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(LOGIN_FLOW_PATH))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let reply = remote(&server).start_login().await;

        assert_eq!(reply.transport, TransportOutcome::Maintenance);
        assert!(reply.value.is_none());
        assert!(reply.error.is_none());
    }

    #[tokio::test]
    async fn start_login_returns_ticket() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(LOGIN_FLOW_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "poll": {"token": "poll-token", "endpoint": format!("{}/login/v2/poll", server.uri())},
                "login": "https://cloud.example.com/login/v2/flow/abc"
            })))
            .mount(&server)
            .await;

        let reply = remote(&server).start_login().await;

        assert_eq!(reply.transport, TransportOutcome::Success);
        let ticket = reply.value.expect("ticket");
        assert_eq!(ticket.poll_token, "poll-token");
        assert_eq!(ticket.login_url, "https://cloud.example.com/login/v2/flow/abc");
    }

    #[tokio::test]
    async fn poll_login_status_mapping() {
        let server = MockServer::start().await;
        let ticket = LoginTicket {
            poll_endpoint: format!("{}/login/v2/poll", server.uri()),
            poll_token: "poll-token".to_string(),
            login_url: String::new(),
        };

        Mock::given(method("POST"))
            .and(path("/login/v2/poll"))
            .and(body_string("token=poll-token"))
            .respond_with(ResponseTemplate::new(404))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/login/v2/poll"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "server": "https://cloud.example.com",
                "loginName": "alice",
                "appPassword": "app-secret"
            })))
            .mount(&server)
            .await;

        let remote = remote(&server);
        assert!(matches!(remote.poll_login(&ticket).await, LoginPoll::Pending));
        match remote.poll_login(&ticket).await {
            LoginPoll::Completed(credentials) => {
                assert_eq!(credentials, Credentials::new("alice", "app-secret"));
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn poll_login_maintenance_and_errors() {
        let server = MockServer::start().await;
        let ticket = LoginTicket {
            poll_endpoint: format!("{}/poll", server.uri()),
            poll_token: "t".to_string(),
            login_url: String::new(),
        };
        Mock::given(method("POST"))
            .and(path("/poll"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/poll"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let remote = remote(&server);
        assert!(matches!(remote.poll_login(&ticket).await, LoginPoll::Maintenance));
        assert!(matches!(
            remote.poll_login(&ticket).await,
            LoginPoll::Error(ClientError::Decode(_))
        ));
    }
}
