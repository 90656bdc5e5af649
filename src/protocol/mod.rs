//! Wire protocol definitions
//!
//! Two schemas travel over a transport channel: the control-plane
//! [`RendezvousMessage`] spoken with the rendezvous server, and the
//! session-plane [`Message`] spoken with the peer.

pub mod codec;
mod frame;
mod message;
mod rendezvous;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use codec::MAX_MESSAGE_SIZE;
pub use frame::{encode_rgb_frame, encode_yuv_frame, FramedPixels};
pub use message::{
    AudioFormat, AudioFrame, Clipboard, CursorData, CursorPosition, DisplayInfo,
    EncodedVideoFrame, FileAction, Hash, KeyEvent, LoginRequest, LoginResponse, Message, Misc,
    MouseEvent, PeerInfo, PixelFormat, PublicKey, Rgb, SignedId, TestDelay, VideoFrame, Yuv,
};
pub use rendezvous::{
    ConnType, NatType, PunchHoleFailure, PunchHoleRequest, PunchHoleResponse, RelayResponse,
    RendezvousMessage, RequestRelay,
};

/// A schema that can travel over a transport channel
pub trait WireMessage: Serialize + DeserializeOwned + Send + 'static {
    /// Pixel payload announced by this message, if its raw frames follow
    fn pixel_header(&self) -> Option<PixelFormat> {
        None
    }
}
