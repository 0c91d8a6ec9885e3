use futures::future::BoxFuture;

use quill_core::capability::IdentityProvider;
use quill_core::config::EndpointConfig;
use quill_core::error::{QuillError, Result};

use super::Endpoint;

/// Identity provider admin client: `POST {url}/users/{id}/revoke`.
#[derive(Clone)]
pub struct HttpIdentity {
    endpoint: Endpoint,
}

impl HttpIdentity {
    pub fn new(config: &EndpointConfig) -> Result<Self> {
        Ok(Self {
            endpoint: Endpoint::new("identity", config)?,
        })
    }
}

impl IdentityProvider for HttpIdentity {
    fn revoke<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let url = self.endpoint.url(&format!("users/{user_id}/revoke"));
            match self.endpoint.send(self.endpoint.client.post(url)).await {
                Ok(_) => Ok(()),
                Err(QuillError::NotFound(_)) => {
                    tracing::debug!(user_id, "Identity unknown to provider, nothing to revoke");
                    Ok(())
                }
                Err(e) => Err(e),
            }
        })
    }
}
