//! Runs the relay's long-running processes side by side and shuts them down
//! together.
//!
//! - every process gets the same `CancellationToken`
//! - SIGINT/SIGTERM, or the first process error, cancels all of them
//! - closers run afterwards under a shared timeout, whatever the outcome
//!
//! # Example
//!
//! ```no_run
//! use weighvision_runner::Runner;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let runner = Runner::new()
//!         .with_named_process("heartbeat", Box::new(|ctx| {
//!             Box::pin(async move {
//!                 loop {
//!                     tokio::select! {
//!                         _ = ctx.cancelled() => break,
//!                         _ = tokio::time::sleep(Duration::from_secs(1)) => {
//!                             tracing::info!("still alive");
//!                         }
//!                     }
//!                 }
//!                 Ok(())
//!             })
//!         }))
//!         .with_closer(|| async move {
//!             tracing::info!("flushing");
//!             Ok(())
//!         })
//!         .with_closer_timeout(Duration::from_secs(5));
//!
//!     runner.run().await;
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A process: takes the shared cancellation token and runs until it fires
pub type AppProcess = Box<
    dyn FnOnce(CancellationToken) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>
        + Send,
>;

/// Cleanup run once every process has stopped
pub type Closer =
    Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send>;

/// How the processes ended
#[derive(Debug)]
pub enum RunOutcome {
    /// Stopped by a signal, by the token, or by every process finishing
    Stopped,
    /// The named process failed and brought the others down
    Failed { process: String, error: anyhow::Error },
}

pub struct Runner {
    app_processes: Vec<(String, AppProcess)>,
    closers: Vec<Closer>,
    closer_timeout: Duration,
    cancellation_token: CancellationToken,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner {
    /// No processes, no closers, 10 second closer timeout
    pub fn new() -> Self {
        Self {
            app_processes: Vec::new(),
            closers: Vec::new(),
            closer_timeout: Duration::from_secs(10),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Add a process under a name used in its log lines.
    ///
    /// If it returns an error every other process is cancelled.
    pub fn with_named_process(mut self, name: impl Into<String>, process: AppProcess) -> Self {
        self.app_processes.push((name.into(), process));
        self
    }

    pub fn with_app_process<F, Fut>(self, process: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = format!("process_{}", self.app_processes.len());
        self.with_named_process(name, Box::new(|token| Box::pin(process(token))))
    }

    /// Closers run concurrently after all processes stopped; a failing
    /// closer does not stop the others.
    pub fn with_closer<F, Fut>(mut self, closer: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.closers.push(Box::new(|| Box::pin(closer())));
        self
    }

    pub fn with_closer_timeout(mut self, timeout: Duration) -> Self {
        self.closer_timeout = timeout;
        self
    }

    /// Use an externally owned token, e.g. to stop the runner from a test
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    /// Run until a signal or a process failure, run the closers, then exit
    /// the process with 0 or 1.
    pub async fn run(self) {
        spawn_signal_handlers(self.cancellation_token.clone());

        match self.run_until_stopped().await {
            RunOutcome::Stopped => {
                info!("Application exiting normally");
                std::process::exit(0);
            }
            RunOutcome::Failed { process, error } => {
                error!(process = %process, "Application exiting with error: {:#}", error);
                std::process::exit(1);
            }
        }
    }

    /// Run processes and closers without installing signal handlers or
    /// exiting.
    pub async fn run_until_stopped(self) -> RunOutcome {
        let token = self.cancellation_token;
        let mut join_set = JoinSet::new();

        for (name, process) in self.app_processes {
            let process_token = token.clone();
            join_set.spawn(async move {
                debug!(process = %name, "starting process");
                let result = process(process_token).await;
                (name, result)
            });
        }

        let mut outcome = RunOutcome::Stopped;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((name, Ok(()))) => {
                    debug!(process = %name, "process completed");
                }
                Ok((name, Err(err))) => {
                    if !token.is_cancelled() {
                        error!(process = %name, "process error: {:#}", err);
                        outcome = RunOutcome::Failed {
                            process: name,
                            error: err,
                        };
                        token.cancel();
                    } else {
                        warn!(process = %name, "process error during shutdown: {:#}", err);
                    }
                }
                Err(err) => {
                    error!("process panicked: {}", err);
                    if !token.is_cancelled() {
                        outcome = RunOutcome::Failed {
                            process: "unknown".to_string(),
                            error: anyhow::anyhow!("process panicked: {}", err),
                        };
                        token.cancel();
                    }
                }
            }
        }

        if !self.closers.is_empty() {
            info!("Running closers with timeout of {:?}", self.closer_timeout);
            match tokio::time::timeout(self.closer_timeout, run_closers(self.closers)).await {
                Ok(()) => info!("All closers completed"),
                Err(_) => error!("Closers timed out after {:?}", self.closer_timeout),
            }
        }

        outcome
    }
}

fn spawn_signal_handlers(token: CancellationToken) {
    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal");
                ctrl_c_token.cancel();
            }
            Err(err) => error!("Error setting up signal handler: {}", err),
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM signal");
                token.cancel();
            }
            Err(err) => error!("Error setting up SIGTERM handler: {}", err),
        }
    });
}

async fn run_closers(closers: Vec<Closer>) {
    let mut closer_set = JoinSet::new();
    for closer in closers {
        closer_set.spawn(closer());
    }

    while let Some(result) = closer_set.join_next().await {
        match result {
            Ok(Ok(())) => debug!("Closer completed successfully"),
            Ok(Err(err)) => error!("Closer error: {:#}", err),
            Err(err) => error!("Closer panicked: {}", err),
        }
    }
}
