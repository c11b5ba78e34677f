//! Perception types shared by the pipeline, the prompt builder, and the gateway
//!
//! Field names follow the vision service JSON (snake_case). Everything is
//! optional on the wire; unknown fields such as raw landmark arrays are ignored.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Normalised 3D position. Hand positions arrive in `[-1, 1]` screen space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Point3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Extended/curled state per finger.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Fingers {
    pub thumb: bool,
    pub index: bool,
    pub middle: bool,
    pub ring: bool,
    pub pinky: bool,
}

impl Fingers {
    pub fn extended_count(&self) -> usize {
        [self.thumb, self.index, self.middle, self.ring, self.pinky]
            .iter()
            .filter(|f| **f)
            .count()
    }
}

/// A classified gesture, as pushed by the vision service.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GestureObservation {
    #[serde(rename = "type")]
    pub kind: String,
    pub position: Point3,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingers: Option<Fingers>,
    /// `left` / `right` when the gesture came from per-hand tracking.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hand: Option<String>,
}

impl GestureObservation {
    pub fn new(kind: impl Into<String>, position: Point3, confidence: f64) -> Self {
        Self {
            kind: kind.into(),
            position,
            confidence,
            ..Default::default()
        }
    }

    /// `unknown`, `none` and empty classifications never trigger inference.
    pub fn is_actionable(&self) -> bool {
        let kind = self.kind.trim();
        !(kind.is_empty() || kind == "unknown" || kind == "none")
    }
}

/// Per-hand tracking state.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandState {
    pub detected: bool,
    pub gesture: String,
    pub position: Point3,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingers: Option<Fingers>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hands {
    pub left: Option<HandState>,
    pub right: Option<HandState>,
}

impl Hands {
    /// Detected hands as `(label, state)` pairs, left first.
    pub fn detected(&self) -> impl Iterator<Item = (&'static str, &HandState)> {
        [("left", self.left.as_ref()), ("right", self.right.as_ref())]
            .into_iter()
            .filter_map(|(label, hand)| hand.filter(|h| h.detected).map(|h| (label, h)))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadPose {
    pub tilt: f64,
    pub turn: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MouthFeatures {
    pub mouth_open: bool,
    pub smile_score: f64,
    pub is_smiling: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Engagement {
    pub score: f64,
    pub is_engaged: bool,
}

/// Face detection result.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaceState {
    pub detected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head_pose: Option<HeadPose>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mouth_features: Option<MouthFeatures>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engagement: Option<Engagement>,
    /// Blendshape scores. Ordered so prompt text is deterministic.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expressions: Option<BTreeMap<String, f64>>,
}

impl FaceState {
    /// Strongest blendshape, if any scored above zero.
    pub fn dominant_expression(&self) -> Option<(&str, f64)> {
        self.expressions
            .as_ref()?
            .iter()
            .filter(|(_, score)| **score > 0.0)
            .fold(None, |best: Option<(&str, f64)>, (name, score)| match best {
                Some((_, s)) if s >= *score => best,
                _ => Some((name.as_str(), *score)),
            })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Orientation {
    pub pitch: f64,
    pub yaw: f64,
    pub roll: f64,
}

/// Body pose result.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BodyState {
    pub detected: bool,
    /// `standing`, `sitting`, `leaning` or `unknown`.
    pub posture: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orientation: Option<Orientation>,
}

/// Eye tracking result.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EyeState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub combined_gaze: Option<Point3>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attention_score: Option<f64>,
}

/// Structured context used to enrich a prompt. Never persisted.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerceptionContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gesture: Option<GestureObservation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hands: Option<Hands>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub face: Option<FaceState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<BodyState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eyes: Option<EyeState>,
}

impl PerceptionContext {
    pub fn from_gesture(gesture: GestureObservation) -> Self {
        Self {
            gesture: Some(gesture),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.gesture.is_none()
            && self.hands.is_none()
            && self.face.is_none()
            && self.body.is_none()
            && self.eyes.is_none()
    }
}

/// Unified tracking frame posted by the vision service.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingSnapshot {
    pub face: Option<FaceState>,
    pub hands: Hands,
    pub body: Option<BodyState>,
    pub eyes: Option<EyeState>,
    pub timestamp: u64,
}

impl TrackingSnapshot {
    /// Actionable gestures carried by the detected hands.
    pub fn hand_gestures(&self) -> Vec<GestureObservation> {
        self.hands
            .detected()
            .map(|(label, hand)| GestureObservation {
                kind: hand.gesture.clone(),
                position: hand.position,
                confidence: hand.confidence,
                timestamp: hand.timestamp.or(Some(self.timestamp)),
                fingers: hand.fingers,
                hand: Some(label.to_string()),
            })
            .filter(GestureObservation::is_actionable)
            .collect()
    }

    /// Prompt context for one of this snapshot's gestures.
    pub fn context_for(&self, gesture: GestureObservation) -> PerceptionContext {
        PerceptionContext {
            gesture: Some(gesture),
            hands: Some(self.hands.clone()),
            face: self.face.clone(),
            body: self.body.clone(),
            eyes: self.eyes.clone(),
        }
    }
}
