//! Offline token-cost approximation for request payloads.
//!
//! Nothing here talks to a provider: the numbers only need to be close enough for
//! rate-window accounting, and they err on the high side.

use forge_types::{ChatMessage, ContentPart, ModelCallRequest};

/// Average characters per token for mixed English/code text.
pub const CHARS_PER_TOKEN: u64 = 4;
/// Framing overhead charged per conversation turn (role markers, separators).
pub const TOKENS_PER_TURN: u64 = 4;
/// Flat cost of an image that fits inside one tile, or whose size is unknown.
pub const IMAGE_TILE_TOKENS: u64 = 258;
pub const IMAGE_SMALL_EDGE_PX: u32 = 384;
pub const IMAGE_TILE_EDGE_PX: u32 = 768;

pub fn estimate_text_tokens(text: &str) -> u64 {
    let chars = text.chars().count() as u64;
    chars.div_ceil(CHARS_PER_TOKEN)
}

pub fn estimate_image_tokens(width: Option<u32>, height: Option<u32>) -> u64 {
    let (Some(width), Some(height)) = (width, height) else {
        return IMAGE_TILE_TOKENS;
    };
    if width <= IMAGE_SMALL_EDGE_PX && height <= IMAGE_SMALL_EDGE_PX {
        return IMAGE_TILE_TOKENS;
    }
    let tiles_x = u64::from(width.max(1).div_ceil(IMAGE_TILE_EDGE_PX));
    let tiles_y = u64::from(height.max(1).div_ceil(IMAGE_TILE_EDGE_PX));
    tiles_x * tiles_y * IMAGE_TILE_TOKENS
}

pub fn estimate_part_tokens(part: &ContentPart) -> u64 {
    match part {
        ContentPart::Text { text } => estimate_text_tokens(text),
        ContentPart::Image { width, height, .. } => estimate_image_tokens(*width, *height),
    }
}

pub fn estimate_message_tokens(message: &ChatMessage) -> u64 {
    TOKENS_PER_TURN
        + message
            .parts
            .iter()
            .map(estimate_part_tokens)
            .sum::<u64>()
}

/// Input-side cost of a request: system instruction, every turn and the serialized
/// tool declarations.
pub fn estimate_request_tokens(request: &ModelCallRequest) -> u64 {
    let system = request
        .system_instruction
        .as_deref()
        .map(|s| TOKENS_PER_TURN + estimate_text_tokens(s))
        .unwrap_or(0);
    let turns = request
        .turns
        .iter()
        .map(estimate_message_tokens)
        .sum::<u64>();
    let tools = request
        .tools
        .as_ref()
        .map(|tools| {
            tools
                .iter()
                .map(|tool| {
                    estimate_text_tokens(&tool.name)
                        + estimate_text_tokens(&tool.description)
                        + estimate_text_tokens(&tool.input_schema.to_string())
                })
                .sum::<u64>()
        })
        .unwrap_or(0);
    system + turns + tools
}

/// Returns the request with its `estimated_input_tokens` filled in.
pub fn with_estimate(request: ModelCallRequest) -> ModelCallRequest {
    let tokens = estimate_request_tokens(&request);
    request.with_estimated_input_tokens(tokens)
}
