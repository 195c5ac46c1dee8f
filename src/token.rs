use serde::{Deserialize, Serialize};

/// Token identifier - matches the engine's `int32_t` token type
pub type TokenId = i32;

/// One generated token with its decoded text piece
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPiece {
    pub id: TokenId,
    pub text: String,
}
