// Identifier newtypes and the game-kind enumeration.
//
// Ids are transparent over `u64` on the wire so the JSON stays `{"gameId": 7}`
// rather than a nested object. `GameKind` selects both the simulation rules
// and which command registrations apply to a game.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GameId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl fmt::Display for GameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "game#{}", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "user#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameKind {
    /// Free roaming with items and projectiles
    Exploration,
    /// Tile-locked movement with timed bombs
    Bomber,
}

impl GameKind {
    pub const ALL: [GameKind; 2] = [GameKind::Exploration, GameKind::Bomber];

    pub fn as_str(&self) -> &'static str {
        match self {
            GameKind::Exploration => "EXPLORATION",
            GameKind::Bomber => "BOMBER",
        }
    }
}

impl fmt::Display for GameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GameKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        GameKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown game kind `{}`", s))
    }
}
