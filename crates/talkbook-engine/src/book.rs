use std::sync::Arc;
use std::time::Duration;

use talkbook_types::{PlaybackStatus, Resource};

use crate::context::PlayerContext;
use crate::error::Result;
use crate::player::Player;
use crate::playlist::PlayList;
use crate::position::PositionStore;

/// A catalog item that can be listened to.
pub trait ContentItem: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    /// Every resource of the item, playable or not, in catalog order.
    fn resources(&self) -> &[Resource];
}

/// A content item together with the player for its audio.
pub struct PlayableBook<C: ContentItem> {
    item: C,
    player: Player,
}

impl<C: ContentItem> PlayableBook<C> {
    /// Build the playlist from the item's resources and restore its position.
    pub fn open(item: C, ctx: PlayerContext, store: Arc<dyn PositionStore>) -> Self {
        let playlist = PlayList::from_resources(item.resources().iter().cloned(), &ctx.config);
        tracing::info!(
            id = item.id(),
            name = item.name(),
            fragments = playlist.len(),
            "book opened"
        );
        Self {
            player: Player::open(playlist, ctx, store),
            item,
        }
    }

    pub fn item(&self) -> &C {
        &self.item
    }

    pub fn player(&self) -> &Player {
        &self.player
    }

    pub fn play_pause(&self) -> Result<()> {
        self.player.play_pause()
    }

    pub fn stop(&self) {
        self.player.stop()
    }

    pub fn next_fragment(&self) -> Result<()> {
        self.player.set_fragment(self.player.fragment_index() + 1)
    }

    pub fn previous_fragment(&self) -> Result<()> {
        self.player
            .set_fragment(self.player.fragment_index().saturating_sub(1))
    }

    pub fn change_offset(&self, delta_ms: i64) -> Result<()> {
        self.player.change_offset(delta_ms)
    }

    pub fn set_position(&self, target: Duration) -> Result<()> {
        self.player.set_position(target)
    }

    pub fn status(&self) -> PlaybackStatus {
        self.player.status()
    }

    pub fn save(&self) -> Result<()> {
        self.player.save()
    }

    /// Stop playback and persist the position.
    pub fn close(self) -> Result<C> {
        self.player.stop();
        self.player.save()?;
        tracing::info!(id = self.item.id(), "book closed");
        Ok(self.item)
    }
}
