use reqwest::{
    StatusCode,
    blocking::{Client, RequestBuilder, Response},
};
use serde::Serialize;
use tee_runner_models::errors::RequestHandlerError;

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("api error ({status}): [{error_code}] {message}")]
    Api { status: StatusCode, error_code: String, message: String },
}

pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: String, token: Option<String>) -> Self {
        Self { client: Client::new(), base_url, token }
    }

    pub fn get(&self, path: &str) -> Result<serde_json::Value, RequestError> {
        let request = self.client.get(format!("{}{path}", self.base_url));
        self.send(request)
    }

    pub fn post<B: Serialize>(&self, path: &str, body: &B) -> Result<serde_json::Value, RequestError> {
        let request = self.client.post(format!("{}{path}", self.base_url)).json(body);
        self.send(request)
    }

    pub fn delete(&self, path: &str) -> Result<serde_json::Value, RequestError> {
        let request = self.client.delete(format!("{}{path}", self.base_url));
        self.send(request)
    }

    fn send(&self, mut request: RequestBuilder) -> Result<serde_json::Value, RequestError> {
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send()?;
        Self::handle_response(response)
    }

    fn handle_response(response: Response) -> Result<serde_json::Value, RequestError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json()?);
        }
        let (error_code, message) = match response.json::<RequestHandlerError>() {
            Ok(error) => (error.error_code, error.message),
            Err(_) => ("UNKNOWN".to_string(), "could not decode error response".to_string()),
        };
        Err(RequestError::Api { status, error_code, message })
    }
}
