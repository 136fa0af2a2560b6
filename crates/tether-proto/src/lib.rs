mod ackset;
mod dedup;
mod frame;
mod mid;

pub use ackset::AckSet;
pub use dedup::DedupWindow;
pub use frame::{Frame, FrameError, MAX_ID, RESTART_ID, encode_ack, encode_data, parse};
pub use mid::MidGen;
