//! Session-plane messages exchanged with the remote peer
//!
//! Only the handshake messages (`SignedId`, `PublicKey`), `TestDelay` and
//! `VideoFrame` are interpreted by this crate. Everything else is carried
//! as-is for the input, clipboard, cursor, audio and file collaborators.

use serde::{Deserialize, Serialize};

use super::WireMessage;

/// Peer identity blob, signed with the peer's identity key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedId {
    pub id: Vec<u8>,
}

/// Key exchange reply. Both fields empty means the session runs unencrypted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    pub asymmetric_value: Vec<u8>,
    pub symmetric_value: Vec<u8>,
}

impl PublicKey {
    /// True for the explicit "no encryption" reply
    pub fn is_empty(&self) -> bool {
        self.asymmetric_value.is_empty() && self.symmetric_value.is_empty()
    }
}

/// Round-trip delay probe
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestDelay {
    pub time: i64,
    pub from_client: bool,
    pub last_delay: u32,
    pub target_bitrate: u32,
}

/// One encoded VP9 frame
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedVideoFrame {
    pub data: Vec<u8>,
    pub key: bool,
    pub pts: i64,
}

/// Header announcing one trailing raw RGB frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rgb {
    pub compress: bool,
}

/// Header announcing three trailing raw planes (Y, U, V)
///
/// U and V rows are `stride / 2` bytes wide.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Yuv {
    pub compress: bool,
    pub stride: u32,
}

impl Yuv {
    /// Row width of the U and V planes
    pub fn chroma_stride(&self) -> u32 {
        self.stride / 2
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoFrame {
    Vp9s(Vec<EncodedVideoFrame>),
    Rgb(Rgb),
    Yuv(Yuv),
}

/// Pixel payload format announced by a header message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb(Rgb),
    Yuv(Yuv),
}

impl PixelFormat {
    /// Number of raw frames that follow the header
    pub fn frame_count(&self) -> usize {
        match self {
            PixelFormat::Rgb(_) => 1,
            PixelFormat::Yuv(_) => 3,
        }
    }
}

/// Login challenge sent by the peer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hash {
    pub salt: String,
    pub challenge: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: Vec<u8>,
    pub my_id: String,
    pub my_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayInfo {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub username: String,
    pub hostname: String,
    pub platform: String,
    pub displays: Vec<DisplayInfo>,
    pub current_display: u32,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoginResponse {
    Error(String),
    PeerInfo(PeerInfo),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MouseEvent {
    pub mask: i32,
    pub x: i32,
    pub y: i32,
    pub modifiers: Vec<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEvent {
    pub down: bool,
    pub press: bool,
    pub chr: u32,
    pub modifiers: Vec<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clipboard {
    pub compress: bool,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorData {
    pub id: u64,
    pub hotx: i32,
    pub hoty: i32,
    pub width: i32,
    pub height: i32,
    pub colors: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFrame {
    pub data: Vec<u8>,
}

/// File transfer request, opaque to this layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAction {
    pub payload: Vec<u8>,
}

/// Miscellaneous control payload, opaque to this layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Misc {
    pub payload: Vec<u8>,
}

/// A session-plane message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    SignedId(SignedId),
    PublicKey(PublicKey),
    TestDelay(TestDelay),
    VideoFrame(VideoFrame),
    Hash(Hash),
    LoginRequest(LoginRequest),
    LoginResponse(LoginResponse),
    MouseEvent(MouseEvent),
    KeyEvent(KeyEvent),
    Clipboard(Clipboard),
    CursorData(CursorData),
    CursorId(u64),
    CursorPosition(CursorPosition),
    AudioFormat(AudioFormat),
    AudioFrame(AudioFrame),
    FileAction(FileAction),
    Misc(Misc),
}

impl Message {
    /// Short name of the variant, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Message::SignedId(_) => "signed_id",
            Message::PublicKey(_) => "public_key",
            Message::TestDelay(_) => "test_delay",
            Message::VideoFrame(_) => "video_frame",
            Message::Hash(_) => "hash",
            Message::LoginRequest(_) => "login_request",
            Message::LoginResponse(_) => "login_response",
            Message::MouseEvent(_) => "mouse_event",
            Message::KeyEvent(_) => "key_event",
            Message::Clipboard(_) => "clipboard",
            Message::CursorData(_) => "cursor_data",
            Message::CursorId(_) => "cursor_id",
            Message::CursorPosition(_) => "cursor_position",
            Message::AudioFormat(_) => "audio_format",
            Message::AudioFrame(_) => "audio_frame",
            Message::FileAction(_) => "file_action",
            Message::Misc(_) => "misc",
        }
    }
}

impl WireMessage for Message {
    fn pixel_header(&self) -> Option<PixelFormat> {
        match self {
            Message::VideoFrame(VideoFrame::Rgb(rgb)) => Some(PixelFormat::Rgb(*rgb)),
            Message::VideoFrame(VideoFrame::Yuv(yuv)) => Some(PixelFormat::Yuv(*yuv)),
            _ => None,
        }
    }
}
