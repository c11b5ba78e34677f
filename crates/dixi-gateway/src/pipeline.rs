//! Gesture pipeline: cooldown gate → inference → broadcast
//!
//! Raw perception is always mirrored to viewers. Only the first actionable
//! gesture of each type per cooldown window reaches the orchestrator, and
//! that call runs on its own task so ingest never waits on a model.

use crate::hub::BroadcastHub;
use crate::vision::VisionClient;
use dixi_core::{channel, CooldownGate, GestureObservation, PerceptionContext, TrackingSnapshot};
use dixi_llm::{ImageInput, InferenceOrchestrator, InferenceResponse};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Sent to viewers in place of an answer when inference failed.
pub const DEGRADED_REPLY: &str =
    "Sorry, I'm having trouble thinking right now. Please try again in a moment.";

pub struct GesturePipeline {
    gate: Arc<CooldownGate>,
    orchestrator: Arc<InferenceOrchestrator>,
    hub: Arc<BroadcastHub>,
    vision: Arc<VisionClient>,
    window: Duration,
}

impl GesturePipeline {
    pub fn new(
        gate: Arc<CooldownGate>,
        orchestrator: Arc<InferenceOrchestrator>,
        hub: Arc<BroadcastHub>,
        vision: Arc<VisionClient>,
        window: Duration,
    ) -> Self {
        Self {
            gate,
            orchestrator,
            hub,
            vision,
            window,
        }
    }

    /// Mirror a gesture to viewers and, if it passes the gate, start an
    /// inference whose answer is broadcast when ready.
    pub fn handle_gesture(&self, gesture: GestureObservation) -> Option<JoinHandle<()>> {
        self.hub.broadcast(channel::GESTURE, &gesture);
        let context = PerceptionContext::from_gesture(gesture.clone());
        self.trigger(gesture, context)
    }

    /// Mirror a full tracking snapshot, then route each detected hand gesture
    /// through the gate with the snapshot as context.
    pub fn handle_tracking(&self, snapshot: TrackingSnapshot) -> Vec<JoinHandle<()>> {
        self.hub.broadcast(channel::TRACKING, &snapshot);
        snapshot
            .hand_gestures()
            .into_iter()
            .filter_map(|gesture| {
                let context = snapshot.context_for(gesture.clone());
                self.trigger(gesture, context)
            })
            .collect()
    }

    /// Capture the current camera frame, describe it, and broadcast the
    /// answer. Failures produce the degraded reply.
    pub async fn analyze_current_frame(&self, prompt: Option<&str>) -> InferenceResponse {
        let response = match self.vision.capture_frame().await {
            Ok(frame) => {
                let image = ImageInput::jpeg(frame);
                match self.orchestrator.analyze_image(&image, prompt).await {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("Frame analysis failed: {}", e);
                        InferenceResponse::degraded(DEGRADED_REPLY)
                    }
                }
            }
            Err(e) => {
                warn!("Frame capture failed: {}", e);
                InferenceResponse::degraded(DEGRADED_REPLY)
            }
        };
        self.hub.broadcast(channel::AI_RESPONSE, &response);
        response
    }

    fn trigger(&self, gesture: GestureObservation, context: PerceptionContext) -> Option<JoinHandle<()>> {
        if !gesture.is_actionable() {
            return None;
        }
        if !self.gate.try_acquire_now(&gesture.kind, self.window) {
            debug!(gesture = %gesture.kind, "Cooling down");
            return None;
        }

        let query = prompt_for(&gesture);
        let orchestrator = self.orchestrator.clone();
        let hub = self.hub.clone();
        let kind = gesture.kind;

        Some(tokio::spawn(async move {
            let response = match orchestrator.infer(&query, Some(context)).await {
                Ok(r) => {
                    info!(gesture = %kind, provider = ?r.metadata.provider_used, cached = r.metadata.cached, "Gesture answered");
                    r
                }
                Err(e) => {
                    warn!(gesture = %kind, "Gesture inference failed: {}", e);
                    InferenceResponse::degraded(DEGRADED_REPLY)
                }
            };
            hub.broadcast(channel::AI_RESPONSE, &response);
        }))
    }
}

/// The question asked on the user's behalf for a gesture.
pub fn prompt_for(gesture: &GestureObservation) -> String {
    match gesture.kind.trim() {
        "point" => "What am I pointing at? Describe what might be there.".into(),
        "wave" => "Say hello back to me.".into(),
        "thumbs_up" => "I like this. Respond briefly and positively.".into(),
        "thumbs_down" => "I don't like this. Ask what I would prefer instead.".into(),
        "open_palm" => "I'm raising my hand. Ask me what I need.".into(),
        "fist" => "I'm holding a fist. Check in on how I'm doing.".into(),
        "pinch" => "I'm pinching as if picking something up. What could I be grabbing?".into(),
        "peace" => "Respond to my peace sign.".into(),
        "ok" => "I'm signalling OK. Acknowledge it.".into(),
        "swipe_left" => "I swiped left. Move on to something else.".into(),
        "swipe_right" => "I swiped right. Tell me more.".into(),
        other => format!("I just made a {} gesture. How do you respond?", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dixi_core::Point3;

    #[test]
    fn prompt_for_known_and_unknown_gestures() {
        let point = GestureObservation::new("point", Point3::default(), 0.9);
        assert!(prompt_for(&point).contains("pointing"));
        let odd = GestureObservation::new("spock", Point3::default(), 0.9);
        assert!(prompt_for(&odd).contains("spock"));
    }
}
