use poem::{Endpoint, Middleware, Request};
use reqwest::{Method, StatusCode};

pub const API_KEY_HEADER: &str = "X-API-Key";

/// Static `X-API-Key` check guarding the `/servers*` routes.
pub struct ApiKeyMiddleware {
    key: String,
}

impl ApiKeyMiddleware {
    pub fn new(key: String) -> Self {
        Self { key }
    }
}

impl<E: Endpoint> Middleware<E> for ApiKeyMiddleware {
    type Output = ApiKeyMiddlewareImpl<E>;

    fn transform(&self, ep: E) -> Self::Output {
        ApiKeyMiddlewareImpl {
            ep,
            key: self.key.clone(),
        }
    }
}

pub struct ApiKeyMiddlewareImpl<E> {
    ep: E,
    key: String,
}

impl<E: Endpoint> Endpoint for ApiKeyMiddlewareImpl<E> {
    type Output = E::Output;

    async fn call(&self, req: Request) -> poem::Result<Self::Output> {
        if req.method() == Method::OPTIONS {
            return self.ep.call(req).await;
        }

        match req
            .headers()
            .get(API_KEY_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            Some(key) if key == self.key => self.ep.call(req).await,
            Some(_) => Err(poem::Error::from_string(
                "API key does not match",
                StatusCode::UNAUTHORIZED,
            )),
            None => Err(poem::Error::from_string(
                "No API key provided",
                StatusCode::UNAUTHORIZED,
            )),
        }
    }
}
