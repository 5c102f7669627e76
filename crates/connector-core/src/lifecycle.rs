use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Connector-wide run state. Transitions only move forward:
/// `Init → Running → Draining → Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectorState {
    Init = 0,
    Running = 1,
    Draining = 2,
    Closed = 3,
}

impl ConnectorState {
    fn from_u8(raw: u8) -> ConnectorState {
        match raw {
            0 => ConnectorState::Init,
            1 => ConnectorState::Running,
            2 => ConnectorState::Draining,
            _ => ConnectorState::Closed,
        }
    }
}

/// Owns the root cancellation token and the connector state machine.
///
/// The first SIGINT/SIGTERM cancels the token and moves the connector to
/// `Draining`; further signals during the drain are logged but do not
/// escalate. Every driver call and worker derives its cancellation from
/// [`Lifecycle::token`].
pub struct Lifecycle {
    token: CancellationToken,
    state: AtomicU8,
}

impl Lifecycle {
    pub fn new() -> Arc<Self> {
        Arc::new(Lifecycle {
            token: CancellationToken::new(),
            state: AtomicU8::new(ConnectorState::Init as u8),
        })
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn state(&self) -> ConnectorState {
        ConnectorState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Advance to `next`. Backward or repeated transitions are ignored and
    /// return `false`.
    pub fn advance(&self, next: ConnectorState) -> bool {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            if next as u8 <= current {
                return false;
            }
            match self.state.compare_exchange(
                current,
                next as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    info!(from = ?ConnectorState::from_u8(current), to = ?next, "connector state change");
                    if next >= ConnectorState::Draining {
                        self.token.cancel();
                    }
                    return true;
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Install the SIGINT/SIGTERM listener. The task lives for the rest of
    /// the process; it is not joined on shutdown.
    pub fn listen_for_signals(self: Arc<Self>) {
        let lifecycle = self;
        tokio::spawn(async move {
            let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sig) => sig,
                Err(err) => {
                    error!(error = %err, "failed to install SIGTERM handler");
                    return;
                }
            };
            loop {
                tokio::select! {
                    interrupt = tokio::signal::ctrl_c() => {
                        if let Err(err) = interrupt {
                            error!(error = %err, "failed to listen for SIGINT");
                            return;
                        }
                    }
                    _ = sigterm.recv() => {}
                }
                if lifecycle.advance(ConnectorState::Draining) {
                    info!("shutdown signal received, draining");
                } else {
                    warn!("additional shutdown signal received while draining");
                }
            }
        });
    }
}
