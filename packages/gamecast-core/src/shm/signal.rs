//! Wait primitives bridging the capture agents and the encoder threads.

/// Outcome of a multiplexed wait. Stop always wins a tie so shutdown is
/// never starved by a busy producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    Stop,
    FrameReady,
}

/// The encoder-side blocking wait on `{stop, frame_ready}`.
///
/// `frame_ready` has auto-reset semantics: one wakeup consumes one pulse.
/// `stop` is level-triggered and stays set until cleared.
pub trait FrameSignal: Send + Sync {
    /// Blocks until either event fires.
    fn wait(&self) -> Wakeup;

    /// Producer side: pulse frame readiness.
    fn signal_frame(&self);

    /// Sets the stop event, releasing any blocked waiter.
    fn signal_stop(&self);

    /// Clears the stop event before (re)starting an encoder thread.
    fn clear_stop(&self);
}

/// A manual-reset flag visible across the capture boundary
/// (started/stopped/do-not-present). `set`/`reset` are idempotent.
pub trait StateEvent: Send + Sync {
    fn set(&self);
    fn reset(&self);
    fn is_set(&self) -> bool;
}
