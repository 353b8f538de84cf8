use std::{error::Error, net::SocketAddr, process::ExitCode, sync::Arc};

use subrelay_utils::{
    tls_acceptor, EnvelopeHandler, Forwarder, ProxyConfig, SessionContext, SessionEnd,
    SingleIdentityAuthEngine, SmtpSession, SmtpUpstream,
};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let config = match ProxyConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::new("warn"))
                .init();
            error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_directives()))
        .init();

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Proxy stopped");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: ProxyConfig) -> Result<(), Box<dyn Error + Send + Sync>> {
    let upstream = SmtpUpstream::new(&config.upstream)?;
    let forwarder = Forwarder::new(Arc::new(upstream), config.proxy.max_forwards);
    let acceptor = config.proxy.tls.as_ref().map(tls_acceptor).transpose()?;
    let auth = SingleIdentityAuthEngine::new(config.proxy.credentials.clone());

    let listening = config.listen_address();
    info!(
        upstream_host = %config.upstream.host,
        upstream_port = config.upstream.port,
        upstream_tls = ?config.upstream.tls,
        "Forwarding to upstream"
    );
    info!(from = %config.upstream.from, "Rewriting From header");
    if config.allowed_senders.is_empty() {
        warn!("No allowed senders configured, every message will be rejected");
    }

    let config = Arc::new(config);
    let context = Arc::new(SessionContext {
        hostname: config.proxy.hostname.clone(),
        auth: Arc::new(auth),
        handler: EnvelopeHandler::new(config.clone(), forwarder),
        tls_available: acceptor.is_some(),
    });

    let listener = TcpListener::bind(&listening).await?;
    info!(address = %listening, "Starting SMTP proxy");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                };
                let context = context.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_smtp_session(stream, peer, context, acceptor).await {
                        warn!(peer = %peer, error = %e, "Session ended with error");
                    }
                });
            }
            _ = &mut shutdown => {
                info!("Shutting down SMTP proxy");
                return Ok(());
            }
        }
    }
}

async fn handle_smtp_session(
    stream: TcpStream,
    peer: SocketAddr,
    context: Arc<SessionContext>,
    acceptor: Option<TlsAcceptor>,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    stream.set_nodelay(true)?;
    debug!(peer = %peer, "Connection accepted");

    let mut session = SmtpSession::new(context, Some(peer));
    let stream = match session.run(stream).await? {
        SessionEnd::Closed => return Ok(()),
        SessionEnd::StartTls(stream) => stream,
    };

    let Some(acceptor) = acceptor else {
        return Ok(());
    };
    let tls_stream = match acceptor.accept(stream).await {
        Ok(tls_stream) => tls_stream,
        Err(e) => {
            warn!(peer = %peer, error = %e, "TLS handshake failed");
            return Ok(());
        }
    };
    debug!(peer = %peer, "TLS handshake complete");

    session.run(tls_stream).await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
