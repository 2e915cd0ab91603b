//! Delivery of batch bodies to the backend.

use std::time::Duration;

use futures::future::BoxFuture;
use http_body_util::{BodyExt, Full};
use hyper::{
   Request, StatusCode, Uri,
   body::Bytes,
   header::{CONTENT_TYPE, USER_AGENT},
};
use hyper_util::{
   client::legacy::{Client, connect::HttpConnector},
   rt::TokioExecutor,
};
use log::debug;
use tokio::time;

use crate::error::{Result, WearLinkError};

/// Something that can deliver an encoded batch.
///
/// `Ok` means the backend accepted the batch. `BatchRejected` means it never
/// will; every other error is worth retrying.
pub trait Transport: Send + Sync {
   fn post(&self, body: Bytes) -> BoxFuture<'_, Result<()>>;
}

/// Maps a response status onto the delivery outcome.
pub fn classify(status: StatusCode) -> Result<()> {
   if status.is_success() {
      Ok(())
   } else if status.is_client_error()
      && status != StatusCode::REQUEST_TIMEOUT
      && status != StatusCode::TOO_MANY_REQUESTS
   {
      Err(WearLinkError::BatchRejected(status.as_u16()))
   } else {
      Err(WearLinkError::BackendUnavailable(status.as_u16()))
   }
}

/// Plain HTTP `POST` of JSON bodies.
pub struct HttpTransport {
   client: Client<HttpConnector, Full<Bytes>>,
   endpoint: Uri,
   timeout: Duration,
}

impl HttpTransport {
   pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
      let endpoint: Uri = endpoint
         .parse()
         .map_err(|e| WearLinkError::InvalidEndpoint(format!("{endpoint}: {e}")))?;
      if endpoint.scheme_str() != Some("http") || endpoint.host().is_none() {
         return Err(WearLinkError::InvalidEndpoint(format!(
            "{endpoint}: expected http://host[:port]/path"
         )));
      }
      Ok(Self {
         client: Client::builder(TokioExecutor::new()).build_http(),
         endpoint,
         timeout,
      })
   }

   pub const fn endpoint(&self) -> &Uri {
      &self.endpoint
   }

   async fn send(&self, body: Bytes) -> Result<()> {
      let len = body.len();
      let req = Request::post(self.endpoint.clone())
         .header(CONTENT_TYPE, "application/json")
         .header(USER_AGENT, concat!("wearlinkd/", env!("CARGO_PKG_VERSION")))
         .body(Full::new(body))?;

      let exchange = async {
         let resp = self.client.request(req).await?;
         let status = resp.status();
         // Drain so the connection can be reused.
         let _ = resp.into_body().collect().await;
         Ok::<_, WearLinkError>(status)
      };
      let status = time::timeout(self.timeout, exchange)
         .await
         .map_err(|_| WearLinkError::RequestTimeout)??;

      debug!("→ {}: {len} bytes, {status}", self.endpoint);
      classify(status)
   }
}

impl Transport for HttpTransport {
   fn post(&self, body: Bytes) -> BoxFuture<'_, Result<()>> {
      Box::pin(self.send(body))
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_classify() {
      assert!(classify(StatusCode::OK).is_ok());
      assert!(classify(StatusCode::CREATED).is_ok());
      assert!(matches!(
         classify(StatusCode::BAD_REQUEST),
         Err(WearLinkError::BatchRejected(400))
      ));
      assert!(matches!(
         classify(StatusCode::TOO_MANY_REQUESTS),
         Err(WearLinkError::BackendUnavailable(429))
      ));
      assert!(matches!(
         classify(StatusCode::REQUEST_TIMEOUT),
         Err(WearLinkError::BackendUnavailable(408))
      ));
      assert!(matches!(
         classify(StatusCode::BAD_GATEWAY),
         Err(WearLinkError::BackendUnavailable(502))
      ));
   }

   #[test]
   fn test_endpoint_validation() {
      let t = HttpTransport::new("http://127.0.0.1:5000/ingest", Duration::from_secs(1)).unwrap();
      assert_eq!(t.endpoint().path(), "/ingest");
      assert!(matches!(
         HttpTransport::new("https://example.com/ingest", Duration::from_secs(1)),
         Err(WearLinkError::InvalidEndpoint(_))
      ));
      assert!(HttpTransport::new("not a uri", Duration::from_secs(1)).is_err());
   }

   #[tokio::test]
   async fn test_post_to_closed_port_is_retryable() {
      let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
      let port = listener.local_addr().unwrap().port();
      drop(listener);

      let t = HttpTransport::new(&format!("http://127.0.0.1:{port}/"), Duration::from_secs(2))
         .unwrap();
      let res = t.post(Bytes::from_static(b"{}")).await;
      assert!(matches!(res, Err(WearLinkError::HttpClient(_))));
   }
}
