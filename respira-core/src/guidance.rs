//! Per-stage guidance text.
//!
//! Guidance for a stage comes from the remote text generator. When that fails
//! a static text for the stage is used instead so the session never stalls. A
//! refused credential is reported separately so the caller can ask the user to
//! sign in again.

use tracing::warn;

use crate::service::{GuidanceRequest, GuidanceService};

/// Where a guidance text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuidanceSource {
    Generated,
    Fallback,
    /// Static text used because the service refused the user's credentials.
    SignInRequired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guidance {
    pub text: String,
    pub source: GuidanceSource,
}

fn fallback_body(stage_key: &str) -> &'static str {
    match stage_key {
        "opening_preparation" => {
            "welcome to your stress relief session. Find a comfortable position and allow yourself to settle in. Take a moment to notice how you're feeling right now, and know that you're taking a positive step for your well-being."
        }
        "grounding_breathwork" => {
            "let's begin with some gentle breathing. Breathe in slowly through your nose for four counts... hold for two... and exhale gently through your mouth for six counts. Feel yourself becoming more centered with each breath."
        }
        "body_awareness" => {
            "now let's scan through your body. Starting from the top of your head, notice any areas of tension. Allow your shoulders to drop, soften your jaw, and let any tightness melt away as you continue breathing deeply."
        }
        "breathing_with_intention" => {
            "focus on your breath as your anchor. With each inhale, imagine drawing in calm and peace. With each exhale, release any stress or tension you've been carrying. Your breath is your pathway to tranquility."
        }
        "guided_visualization" => {
            "imagine yourself in a peaceful place. Perhaps a quiet beach, a serene forest, or a cozy room filled with soft light. Feel the safety and calm of this space. You are exactly where you need to be."
        }
        "deep_stillness" => {
            "rest in this moment of stillness. There's nothing you need to do, nowhere you need to be. Simply allow yourself to be present, breathing naturally, feeling the peace that comes from within."
        }
        "affirmations" => {
            "you are strong, you are capable, and you are worthy of peace. Repeat to yourself: \"I am calm, I am centered, I am at peace.\" Feel these words resonate within you."
        }
        "closing" => {
            "as we come to the end of this session, take a moment to appreciate what you've given yourself. Carry this sense of calm with you as you return to your day. You have everything you need within you."
        }
        _ => {
            "take a moment to breathe deeply and find your center. You are safe, you are calm, and you are exactly where you need to be."
        }
    }
}

/// Static guidance for a stage, addressed to `user_name` when known.
pub fn fallback_guidance(stage_key: &str, user_name: Option<&str>) -> String {
    let body = fallback_body(stage_key);
    match user_name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => format!("{name}, {body}"),
        None => {
            let mut chars = body.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        }
    }
}

/// Fetch guidance for a stage, falling back to the static text on any error.
pub async fn stage_guidance(
    service: &dyn GuidanceService,
    request: &GuidanceRequest,
    user_name: Option<&str>,
) -> Guidance {
    match service.generate_guidance_text(request).await {
        Ok(text) => Guidance {
            text,
            source: GuidanceSource::Generated,
        },
        Err(e) => {
            warn!(stage = %request.stage_key, error = %e, "Guidance generation failed, using fallback");
            let source = if e.is_auth_failure() {
                GuidanceSource::SignInRequired
            } else {
                GuidanceSource::Fallback
            };
            Guidance {
                text: fallback_guidance(&request.stage_key, user_name),
                source,
            }
        }
    }
}
