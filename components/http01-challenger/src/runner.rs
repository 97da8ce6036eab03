use std::convert::Infallible;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use hyper::body::Incoming;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};

use crate::{ChallengeServerRef, ChallengerError, ChallengerResult};

/// Serves a [`crate::ChallengeServer`] over plain HTTP/1.1.
#[derive(Clone)]
pub struct ChallengeRunner {
    bind_addr: SocketAddr,
    server: ChallengeServerRef,
}

impl ChallengeRunner {
    /// Bind to `0.0.0.0:port`.
    pub fn new(port: u16, server: ChallengeServerRef) -> Self {
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
        Self::with_addr(addr, server)
    }

    pub fn with_addr(addr: SocketAddr, server: ChallengeServerRef) -> Self {
        Self {
            bind_addr: addr,
            server,
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    pub async fn bind(&self) -> ChallengerResult<TcpListener> {
        TcpListener::bind(self.bind_addr)
            .await
            .map_err(|e| ChallengerError::BindFailed(format!("{}: {}", self.bind_addr, e)))
    }

    pub fn start(self) -> ChallengerResult<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run().await {
                error!("challenge runner stopped: {}", e);
            }
        });
        Ok(())
    }

    pub async fn run(&self) -> ChallengerResult<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until the task is dropped.
    pub async fn serve(&self, listener: TcpListener) -> ChallengerResult<()> {
        let local_addr = listener.local_addr().unwrap_or(self.bind_addr);
        info!("challenge server listening on {}", local_addr);

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(ret) => ret,
                Err(e) => {
                    error!("failed to accept tcp connection: {}", e);
                    continue;
                }
            };

            let server = self.server.clone();
            tokio::spawn(async move {
                if let Err(err) = serve_tcp_stream(stream, server).await {
                    error!("failed to serve {}: {}", peer_addr, err);
                }
            });
        }
    }
}

async fn serve_tcp_stream(stream: TcpStream, server: ChallengeServerRef) -> ChallengerResult<()> {
    hyper::server::conn::http1::Builder::new()
        .serve_connection(
            TokioIo::new(stream),
            hyper::service::service_fn(move |req: Request<Incoming>| {
                let resp = server.serve_request(&req);
                async move { Ok::<_, Infallible>(resp) }
            }),
        )
        .await
        .map_err(|e| ChallengerError::StreamError(format!("{}", e)))
}
