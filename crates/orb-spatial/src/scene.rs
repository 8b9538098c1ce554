//! Scene-wide spatial settings

use serde::{Deserialize, Serialize};

use crate::position::Listener;

/// Shoebox room, meters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub width: f32,
    pub height: f32,
    pub depth: f32,
}

impl Default for Room {
    fn default() -> Self {
        Self {
            width: 10.0,
            height: 3.0,
            depth: 8.0,
        }
    }
}

impl Room {
    /// Extra path length of the earliest wall reflection for a listener
    /// in the middle of the room
    pub fn first_reflection_path(&self) -> f32 {
        self.width.min(self.height).min(self.depth).max(0.5)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReverbSettings {
    /// Wet level of the early reflection tap, 0..=1
    pub amount: f32,
    /// Decay in seconds; darkens the reflection tap
    pub decay: f32,
}

impl Default for ReverbSettings {
    fn default() -> Self {
        Self {
            amount: 0.15,
            decay: 1.2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SceneFlags {
    pub doppler: bool,
    pub air_absorption: bool,
    pub crossfeed: bool,
    pub bass_management: bool,
}

impl Default for SceneFlags {
    fn default() -> Self {
        Self {
            doppler: false,
            air_absorption: true,
            crossfeed: false,
            bass_management: true,
        }
    }
}

/// Everything shared by all sources in the scene
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpatialScene {
    pub listener: Listener,
    pub room: Room,
    /// Relative humidity, 0..=1
    pub humidity: f32,
    /// Celsius
    pub temperature: f32,
    pub reverb: ReverbSettings,
    pub flags: SceneFlags,
    /// Distance with unity gain, meters
    pub reference_distance: f32,
    /// Crossfeed amount, 0..=1
    pub crossfeed_amount: f32,
    /// Bass management crossover
    pub crossover_hz: f32,
    /// Level of the bass-managed low band sent to the LFE channel
    pub lfe_send: f32,
}

impl Default for SpatialScene {
    fn default() -> Self {
        Self {
            listener: Listener::default(),
            room: Room::default(),
            humidity: 0.5,
            temperature: 20.0,
            reverb: ReverbSettings::default(),
            flags: SceneFlags::default(),
            reference_distance: 1.0,
            crossfeed_amount: 0.3,
            crossover_hz: 80.0,
            lfe_send: 1.0,
        }
    }
}

impl SpatialScene {
    /// `min(1, ref / d)`; sources inside the reference distance are not boosted
    pub fn distance_gain(&self, distance: f32) -> f32 {
        let reference = self.reference_distance.max(1e-3);
        if distance <= reference {
            1.0
        } else {
            reference / distance
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_gain() {
        let scene = SpatialScene::default();
        assert_eq!(scene.distance_gain(0.0), 1.0);
        assert_eq!(scene.distance_gain(1.0), 1.0);
        assert!((scene.distance_gain(2.0) - 0.5).abs() < 1e-6);
        assert!((scene.distance_gain(10.0) - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_distance_monotonic() {
        let scene = SpatialScene::default();
        let mut last = f32::MAX;
        for i in 0..200 {
            let g = scene.distance_gain(i as f32 * 0.25);
            assert!(g <= last);
            last = g;
        }
    }

    #[test]
    fn test_first_reflection_uses_smallest_dimension() {
        let room = Room::default();
        assert_eq!(room.first_reflection_path(), 3.0);
        let tiny = Room {
            width: 0.1,
            height: 0.1,
            depth: 0.1,
        };
        assert_eq!(tiny.first_reflection_path(), 0.5);
    }
}
