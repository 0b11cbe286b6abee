mod http;
mod session;

use mailrelay_utils::{load_config_or_default, load_tls_server_config, Forwarder, SmtpForwarder};
use session::{Flow, SmtpSession};
use std::{io, path::Path, sync::Arc, time::Duration};
use tokio::{
    io::{split, BufReader},
    net::{TcpListener, TcpStream},
};
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const CONFIG_PATH: &str = "mailrelay.toml";

/// Pause after a failed accept, errors such as `EMFILE` persist for a while.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// State shared by every inbound connection.
struct RelayState {
    hostname: String,
    forwarder: Arc<dyn Forwarder>,
    tls_acceptor: Option<TlsAcceptor>,
}

/// Main function for the relay.
///
/// Listens for inbound SMTP connections, handling each of them in its own
/// task with [`handle_connection`], and serves the liveness endpoint in a
/// separate task. Runs until interrupted.
#[tokio::main(flavor = "multi_thread", worker_threads = 16)]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::var("MAILRELAY_CONFIG").unwrap_or_else(|_| CONFIG_PATH.to_string());
    let config = load_config_or_default(Path::new(&config_path))?;
    info!(path = %config_path, "Configuration loaded");

    let forwarder: Arc<dyn Forwarder> = Arc::new(SmtpForwarder::new(&config.upstream)?);
    let tls_acceptor = match &config.relay.tls {
        Some(tls) => {
            let tls_config = load_tls_server_config(&tls.cert, &tls.key)?;
            Some(TlsAcceptor::from(Arc::new(tls_config)))
        }
        None => None,
    };
    let state = Arc::new(RelayState {
        hostname: config.relay.hostname.clone(),
        forwarder,
        tls_acceptor,
    });

    let http_address = format!("{}:{}", config.http.host, config.http.port);
    tokio::spawn(async move {
        if let Err(e) = http::serve(http_address).await {
            error!(error = %e, "Liveness endpoint stopped");
        }
    });

    let listening = format!("{}:{}", config.relay.host, config.relay.port);
    let listener = TcpListener::bind(&listening).await?;
    info!(
        address = %listening,
        starttls = state.tls_acceptor.is_some(),
        "Mailrelay SMTP running"
    );

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                return Ok(());
            }
        };
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "Failed to accept connection");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                continue;
            }
        };
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, state).await {
                warn!(peer = %peer, error = %e, "SMTP session ended with error");
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<RelayState>) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let client_ip = stream.peer_addr().ok().map(|addr| addr.ip());

    let mut session = SmtpSession::new(state.hostname.clone(), state.forwarder.clone(), client_ip)
        .with_tls(state.tls_acceptor.is_some());
    let (reader, mut writer) = split(stream);
    let mut reader = BufReader::new(reader);

    session.greet(&mut writer).await?;
    if session.run(&mut reader, &mut writer).await? != Flow::StartTls {
        return Ok(());
    }

    let Some(tls_acceptor) = state.tls_acceptor.clone() else {
        return Ok(());
    };
    let stream = reader.into_inner().unsplit(writer);
    let tls_stream = match tls_acceptor.accept(stream).await {
        Ok(tls_stream) => tls_stream,
        Err(e) => {
            warn!(client_ip = ?client_ip, error = %e, "TLS handshake failed");
            return Ok(());
        }
    };
    info!(client_ip = ?client_ip, "TLS handshake complete");

    session.upgraded();
    let (reader, mut writer) = split(tls_stream);
    let mut reader = BufReader::new(reader);
    session.run(&mut reader, &mut writer).await?;
    Ok(())
}
