//! Prompt construction and cache keys

use dixi_core::{GestureObservation, PerceptionContext};
use sha2::{Digest, Sha256};

/// Attention score below which the user is described as looking away.
const LOW_ATTENTION: f64 = 0.3;

/// Blendshape score at which the strongest expression is mentioned.
const EXPRESSION_THRESHOLD: f64 = 0.5;

/// Build the prompt sent to a provider. Pure; the same inputs always give the
/// same text. Without context (or with an empty one) the query is returned
/// unchanged.
pub fn build_prompt(query: &str, context: Option<&PerceptionContext>) -> String {
    let clauses = match context {
        Some(ctx) => context_clauses(ctx),
        None => Vec::new(),
    };
    if clauses.is_empty() {
        return query.to_string();
    }
    format!("[Context: {}]\n\n{}", clauses.join(" "), query)
}

fn context_clauses(ctx: &PerceptionContext) -> Vec<String> {
    let mut clauses = Vec::new();

    if let Some(gesture) = ctx.gesture.as_ref().filter(|g| !g.kind.trim().is_empty()) {
        clauses.push(gesture_clause(gesture));
        if let Some(fingers) = gesture.fingers {
            match fingers.extended_count() {
                0 => {}
                1 => clauses.push("They have 1 finger extended.".into()),
                n => clauses.push(format!("They have {} fingers extended.", n)),
            }
        }
    }

    if let Some(face) = ctx.face.as_ref().filter(|f| f.detected) {
        match face.engagement {
            Some(e) if e.is_engaged => clauses.push("They are looking at you and engaged.".into()),
            Some(_) => clauses.push("They seem distracted.".into()),
            None => {}
        }
        if face.mouth_features.map(|m| m.is_smiling).unwrap_or(false) {
            clauses.push("They are smiling.".into());
        }
        if let Some((name, _)) = face
            .dominant_expression()
            .filter(|(_, score)| *score >= EXPRESSION_THRESHOLD)
        {
            clauses.push(format!("Their most pronounced expression is {}.", name));
        }
    }

    if let Some(body) = ctx.body.as_ref().filter(|b| b.detected) {
        let posture = body.posture.trim();
        if !posture.is_empty() && posture != "unknown" {
            clauses.push(format!("They are {}.", posture));
        }
    }

    if let Some(score) = ctx.eyes.as_ref().and_then(|e| e.attention_score) {
        if score < LOW_ATTENTION {
            clauses.push("Their attention appears to be elsewhere.".into());
        }
    }

    clauses
}

/// One sentence describing the gesture.
pub fn gesture_clause(gesture: &GestureObservation) -> String {
    let kind = gesture.kind.trim();
    match kind {
        "point" => format!(
            "The user is pointing at screen position ({:.2}, {:.2}).",
            gesture.position.x, gesture.position.y
        ),
        "wave" => "The user is waving at you.".into(),
        "pinch" => "The user is making a pinch gesture, as if grabbing something.".into(),
        "open_palm" => "The user is showing an open palm.".into(),
        "fist" => "The user is making a fist.".into(),
        "thumbs_up" => "The user gave a thumbs up.".into(),
        "thumbs_down" => "The user gave a thumbs down.".into(),
        "peace" => "The user is showing a peace sign.".into(),
        "ok" => "The user made an OK sign.".into(),
        "swipe_left" => "The user swiped to the left.".into(),
        "swipe_right" => "The user swiped to the right.".into(),
        other => format!("The user performed a {} gesture.", other),
    }
}

/// Cache key for a query against a provider/model pair.
///
/// The query is trimmed and lowercased before hashing. Provider and model
/// appear verbatim so a model change always yields a new key; the 64-bit
/// digest only disambiguates queries.
pub fn cache_key(query: &str, model: &str, provider: &str) -> String {
    let normalized = query.trim().to_lowercase();
    let digest = Sha256::digest(normalized.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    format!("{}:{}:{:016x}", provider, model, u64::from_be_bytes(prefix))
}

/// Rough token estimate (~4 chars per token) for backends that report none.
pub fn estimate_tokens(text: &str) -> u32 {
    (text.chars().count() as u32).div_ceil(4)
}
