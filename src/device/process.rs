//! Two-phase stop of the device tool: graceful signal, grace period, forced kill.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    /// Exited before the stop was requested.
    AlreadyExited,
    /// Exited within the grace period after the stop signal.
    Graceful,
    /// Still running after the grace period and was killed.
    Killed,
}

#[cfg(unix)]
fn request_stop(child: &mut Child) -> std::io::Result<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(std::io::Error::from),
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn request_stop(child: &mut Child) -> std::io::Result<()> {
    // no cooperative signal available; the grace period is skipped by a hard kill
    child.start_kill()
}

/// Stops `child` and reaps it. Never returns before the process is gone.
pub async fn stop_child(child: &mut Child, grace: Duration) -> std::io::Result<StopKind> {
    if child.try_wait()?.is_some() {
        return Ok(StopKind::AlreadyExited);
    }

    if let Err(e) = request_stop(child) {
        tracing::warn!("Graceful stop signal failed: {}", e);
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(_)) => Ok(StopKind::Graceful),
        Ok(Err(e)) => Err(e),
        Err(_) => {
            tracing::warn!("Device tool ignored the stop signal for {:?}; killing it", grace);
            child.kill().await?;
            Ok(StopKind::Killed)
        }
    }
}

pub type StopFuture<'a> = Pin<Box<dyn Future<Output = std::io::Result<StopKind>> + Send + 'a>>;

/// How a run stops its device tool when cancelled or timed out.
pub type StopFn = for<'a> fn(&'a mut Child, Duration) -> StopFuture<'a>;

/// `stop_child` as a `StopFn`.
pub fn two_phase_stop(child: &mut Child, grace: Duration) -> StopFuture<'_> {
    Box::pin(stop_child(child, grace))
}

/// Drains a pipe into a string in the background.
pub fn collect_output<R>(mut pipe: R) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Err(e) = pipe.read_to_end(&mut buf).await {
            tracing::debug!("Reading device tool output failed: {}", e);
        }
        String::from_utf8_lossy(&buf).trim().to_string()
    })
}
