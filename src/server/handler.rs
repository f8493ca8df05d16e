//! Application callbacks
//!
//! The transport core does not know how to record, switch codecs or update
//! a UI. It reports those events through `StreamHandler`, which the
//! application implements. Every method has a no-op default.
//!
//! Callbacks run on the task that observed the event (a connection task or
//! the encoder pump) and are awaited, so they should return quickly.

use std::future::Future;

use crate::error::EncodeError;
use crate::media::VideoCodec;
use crate::registry::Packet;
use crate::session::SessionContext;

/// Handler for transport events
pub trait StreamHandler: Send + Sync + 'static {
    /// A client connected. Return false to reject it.
    fn on_connection(&self, ctx: &SessionContext) -> impl Future<Output = bool> + Send {
        let _ = ctx;
        async { true }
    }

    /// A client was removed; `remaining` is the number still connected
    fn on_disconnect(
        &self,
        ctx: &SessionContext,
        remaining: usize,
    ) -> impl Future<Output = ()> + Send {
        let _ = (ctx, remaining);
        async {}
    }

    /// A client asked to start the local recording
    fn on_start_recording(&self, ctx: &SessionContext) -> impl Future<Output = ()> + Send {
        let _ = ctx;
        async {}
    }

    /// A client asked to stop the local recording
    fn on_stop_recording(&self, ctx: &SessionContext) -> impl Future<Output = ()> + Send {
        let _ = ctx;
        async {}
    }

    /// A client asked for a different codec
    ///
    /// Only called while no recording is active and no other client is
    /// receiving video, since the encoder is shared.
    fn on_codec_selected(
        &self,
        ctx: &SessionContext,
        codec: VideoCodec,
    ) -> impl Future<Output = ()> + Send {
        let _ = (ctx, codec);
        async {}
    }

    /// Every reframed access unit, for local recording
    fn on_access_unit(&self, packet: &Packet) -> impl Future<Output = ()> + Send {
        let _ = packet;
        async {}
    }

    /// The encoder reported a failure
    ///
    /// `was_recording` tells whether a recording was active; the server has
    /// already marked it stopped and the handler should finalize it.
    /// Broadcasting continues.
    fn on_encode_error(
        &self,
        error: &EncodeError,
        was_recording: bool,
    ) -> impl Future<Output = ()> + Send {
        let _ = (error, was_recording);
        async {}
    }
}
