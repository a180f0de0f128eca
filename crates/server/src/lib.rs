mod error;
pub mod logger;

use std::net::SocketAddr;

use axum_server::{Handle, tls_rustls::RustlsConfig};
use config::Config;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub use error::Error;

pub type Result<T> = std::result::Result<T, error::Error>;

pub struct ServeConfig {
    pub listen_address: SocketAddr,
    pub config: Config,
    /// Cancelling this token stops accepting connections and drains the open ones.
    pub shutdown_signal: CancellationToken,
}

pub async fn serve(
    ServeConfig {
        listen_address,
        config,
        shutdown_signal,
    }: ServeConfig,
) -> crate::Result<()> {
    let app = llm::router(&config).await.map_err(Error::Llm)?;

    let listener = TcpListener::bind(listen_address).await.map_err(Error::Bind)?;

    match &config.server.tls {
        Some(tls_config) => {
            let rustls_config = RustlsConfig::from_pem_file(&tls_config.certificate, &tls_config.key)
                .await
                .map_err(|e| Error::Tls(e.to_string()))?;

            log::info!("LLM gateway listening on https://{listen_address}");

            // axum-server takes a std listener.
            let std_listener = listener.into_std().map_err(Error::Bind)?;

            let handle = Handle::new();
            let shutdown_handle = handle.clone();

            tokio::spawn(async move {
                shutdown_signal.cancelled().await;
                shutdown_handle.graceful_shutdown(None);
            });

            axum_server::from_tcp_rustls(std_listener, rustls_config)
                .handle(handle)
                .serve(app.into_make_service())
                .await
                .map_err(Error::Server)?;
        }
        None => {
            log::info!("LLM gateway listening on http://{listen_address}");

            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown_signal.cancelled().await })
                .await
                .map_err(Error::Server)?;
        }
    }

    log::info!("LLM gateway stopped");

    Ok(())
}
