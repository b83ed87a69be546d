//! The trait implemented by anything driven through a [`ServerWrap`](crate::ServerWrap).

/// An object that lives on (and is only touched by) its server thread.
///
/// In threaded mode every hook runs on the server thread. In direct mode
/// they run on the thread that owns the wrapper.
pub trait Server: Send + 'static {
    /// Called once on the server thread before any command runs.
    fn init(&mut self) {}

    /// Called once on the server thread after the last command ran.
    fn finish(&mut self) {}

    /// Renders one frame.
    ///
    /// Draw requests that queue up behind each other are coalesced: only the
    /// newest one reaches the server.
    fn draw(&mut self, swap_buffers: bool, frame_step: f64);
}
