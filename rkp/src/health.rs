//! Health probes declared on a process.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use common::{Probe, ProcessSpec};
use hyper::{Client, Uri};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::exec::run_checked;
use crate::lifecycle::process_env;

/// Run `probe` once. `Ok` means healthy.
pub async fn probe(probe: &Probe, spec: &ProcessSpec, limit: Duration) -> anyhow::Result<()> {
    match probe {
        Probe::Exec(exec) => {
            let cwd = spec.working_dir.as_ref().map(PathBuf::from);
            run_checked(exec, &[], &process_env(spec), cwd.as_deref(), limit).await?;
            Ok(())
        }
        Probe::Tcp { host, port } => {
            timeout(limit, TcpStream::connect((host.as_str(), *port)))
                .await
                .map_err(|_| anyhow!("connect to {host}:{port} timed out"))?
                .with_context(|| format!("connect to {host}:{port}"))?;
            Ok(())
        }
        Probe::Http { url } => {
            let uri: Uri = url.parse().with_context(|| format!("invalid url {url}"))?;
            let resp = timeout(limit, Client::new().get(uri))
                .await
                .map_err(|_| anyhow!("GET {url} timed out"))?
                .with_context(|| format!("GET {url}"))?;
            let status = resp.status();
            if !(status.is_success() || status.is_redirection()) {
                bail!("GET {url} returned {status}");
            }
            Ok(())
        }
    }
}
