//! Minimal HTTP serving for metrics endpoints.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const TEXT_FORMAT: &str = "text/plain; version=0.0.4";

/// Listens on `addr`, accepting Go-style `:port` shorthand.
pub async fn bind(addr: &str) -> crate::Result<TcpListener> {
    let addr: SocketAddr = if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{port}").parse()?
    } else {
        addr.parse()?
    };

    Ok(TcpListener::bind(addr).await?)
}

/// Serves `path` with the output of `render` until the token is cancelled.
/// In-flight connections get a graceful shutdown.
pub fn serve_text(
    listener: TcpListener,
    token: CancellationToken,
    path: String,
    render: Arc<dyn Fn() -> String + Send + Sync>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (stream, peer) = tokio::select! {
                _ = token.cancelled() => break,
                result = listener.accept() => match result {
                    Ok(conn) => conn,
                    Err(err) => {
                        error!(message = "accept new connection failed", %err);
                        continue;
                    }
                }
            };

            let io = TokioIo::new(stream);
            let token = token.clone();
            let path = path.clone();
            let render = Arc::clone(&render);

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let path = path.clone();
                    let render = Arc::clone(&render);
                    async move {
                        let mut response = Response::new(Full::<Bytes>::default());
                        if req.uri().path() == path {
                            response
                                .headers_mut()
                                .insert(CONTENT_TYPE, HeaderValue::from_static(TEXT_FORMAT));
                            *response.body_mut() = Full::new(Bytes::from(render()));
                        } else {
                            *response.status_mut() = StatusCode::NOT_FOUND;
                        }
                        Ok::<_, std::convert::Infallible>(response)
                    }
                });

                let builder = Builder::new(TokioExecutor::new());
                let conn = builder.serve_connection(io, service);
                tokio::pin!(conn);

                let mut shutting_down = false;
                loop {
                    tokio::select! {
                        result = conn.as_mut() => {
                            if let Err(err) = result {
                                trace!(message = "failed to serve http connection", %peer, %err);
                            }
                            break;
                        }
                        _ = token.cancelled(), if !shutting_down => {
                            shutting_down = true;
                            conn.as_mut().graceful_shutdown();
                        }
                    }
                }
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_accepts_go_style_listen() {
        let listener = bind(":0").await.unwrap();
        assert_eq!(
            listener.local_addr().unwrap().ip(),
            "0.0.0.0".parse::<std::net::IpAddr>().unwrap()
        );

        assert!(bind("127.0.0.1:0").await.is_ok());
        assert!(bind("not an address").await.is_err());
    }
}
