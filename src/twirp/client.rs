use http::{header::CONTENT_TYPE, Request, Response};
use serde::{de::DeserializeOwned, Serialize};
use tower::{BoxError, Service, ServiceExt};

use super::{CallIdentity, ClientError, RpcError, CONTENT_TYPE_JSON, PATH_PREFIX};

/// JSON client for one twirp service, sending requests through `transport`.
///
/// Every request carries the [`CallIdentity`] of the call in its extensions,
/// which is how transport middleware learns which method is being invoked.
#[derive(Clone, Debug)]
pub struct Client<S> {
    base_url: String,
    package: String,
    service: String,
    transport: S,
}

impl<S> Client<S> {
    pub fn new(
        base_url: impl Into<String>,
        package: impl Into<String>,
        service: impl Into<String>,
        transport: S,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            package: package.into(),
            service: service.into(),
            transport,
        }
    }

    pub fn url(&self, method: &str) -> String {
        format!(
            "{}{PATH_PREFIX}/{}.{}/{method}",
            self.base_url, self.package, self.service
        )
    }
}

impl<S> Client<S>
where
    S: Service<Request<Vec<u8>>, Response = Response<Vec<u8>>> + Clone,
    S::Error: Into<BoxError>,
{
    pub async fn call<I, O>(&self, method: &str, input: &I) -> Result<O, ClientError>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        let body = serde_json::to_vec(input).map_err(ClientError::Encode)?;
        let request = Request::post(self.url(method))
            .header(CONTENT_TYPE, CONTENT_TYPE_JSON)
            .extension(CallIdentity::new(&self.package, &self.service).with_method(method))
            .body(body)?;

        let response = self
            .transport
            .clone()
            .oneshot(request)
            .await
            .map_err(|err| ClientError::Transport(err.into()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RpcError::from_response(status, response.body()).into());
        }

        serde_json::from_slice(response.body()).map_err(ClientError::Decode)
    }
}
