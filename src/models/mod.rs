pub mod duration;
pub mod item;
pub mod token;

pub use item::VaultItem;
pub use token::{Rotation, SourceSpec, Token, TokenConfig, TokenState, TokenType, VaultSpec};
