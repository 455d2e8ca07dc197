use tokio::sync::watch;

/// Lifecycle of the server.
///
/// The machine only moves forward: Running -> Draining -> Stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Accepting connections, handlers processing.
    Running,
    /// The listener is closed, in-flight connections are finishing up.
    Draining,
    /// The active set is empty, the process is free to exit.
    Stopped,
}

/// Coordinates the transition from a running server to a stopped one.
///
/// Handlers never watch the phase itself, only the force-close signal that
/// fires when the drain window runs out.
pub struct ShutdownController {
    phase: watch::Sender<Phase>,
    forced: watch::Sender<bool>,
}

impl ShutdownController {
    pub fn new() -> Self {
        let (phase, _) = watch::channel(Phase::Running);
        let (forced, _) = watch::channel(false);

        Self { phase, forced }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// A receiver that resolves to `true` once open connections must close.
    pub fn force_signal(&self) -> watch::Receiver<bool> {
        self.forced.subscribe()
    }

    /// Stop accepting; in-flight connections keep going for now.
    pub fn begin_drain(&self) {
        self.phase.send_if_modified(|phase| match phase {
            Phase::Running => {
                *phase = Phase::Draining;
                true
            }
            _ => false,
        });
    }

    /// The drain window has expired, interrupt whatever is still open.
    pub fn force_close(&self) {
        self.forced.send_replace(true);
    }

    /// Every connection is gone, the machine is done.
    pub fn mark_stopped(&self) {
        self.phase.send_if_modified(|phase| match phase {
            Phase::Draining => {
                *phase = Phase::Stopped;
                true
            }
            _ => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::{Phase, ShutdownController};

    #[test]
    fn check_phase_transitions_are_forward_only() {
        let controller = ShutdownController::new();
        assert_eq!(controller.phase(), Phase::Running);

        // stopping is only reachable from draining
        controller.mark_stopped();
        assert_eq!(controller.phase(), Phase::Running);

        controller.begin_drain();
        assert_eq!(controller.phase(), Phase::Draining);

        // a repeated request must not restart the machine
        controller.begin_drain();
        assert_eq!(controller.phase(), Phase::Draining);

        controller.mark_stopped();
        assert_eq!(controller.phase(), Phase::Stopped);

        controller.begin_drain();
        assert_eq!(controller.phase(), Phase::Stopped);
    }

    #[tokio::test]
    async fn check_force_signal_reaches_subscribers() {
        let controller = ShutdownController::new();
        let mut forced = controller.force_signal();

        assert!(!*forced.borrow());

        controller.force_close();
        forced.wait_for(|forced| *forced).await.unwrap();
    }
}
