pub mod book;
pub mod codec;
pub mod config;
pub mod container;
pub mod context;
pub mod device;
pub mod error;
pub mod fragment;
pub mod player;
pub mod playlist;
pub mod position;
pub mod queue;
pub mod sink;
pub mod status;
pub mod stream;
pub mod stretch;
pub mod timer;

#[cfg(test)]
mod test_support;

pub use book::{ContentItem, PlayableBook};
pub use config::{PlayerConfig, StreamConfig};
pub use context::PlayerContext;
pub use device::{DeviceInfo, list_devices};
pub use error::{PlayerError, Result};
pub use player::Player;
pub use playlist::PlayList;
pub use position::{MemoryPositionStore, PositionStore};
pub use status::{NoopObserver, SharedStatus, StatusObserver};
