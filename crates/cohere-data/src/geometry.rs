//! Detector geometry descriptor.
//!
//! Every field is optional. A key that was never provided stays `None` and is
//! left out of the serialized form entirely; nothing here invents a default
//! distance or pixel pitch.

use serde::{Deserialize, Serialize};

/// Position and pixel layout of an area detector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectorGeometry {
    /// Sample-to-detector distance (m).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
    /// Real-space step of one detector pixel, as a 3x2 matrix whose first
    /// column is the step along detector rows and second along columns (m).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basis: Option<[[f64; 2]; 3]>,
    /// Real-space position of the first pixel's corner (m).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corner: Option<[f64; 3]>,
}

impl DetectorGeometry {
    /// Geometry with only a distance and a pixel basis, the minimum needed to
    /// derive a far-field probe basis.
    pub fn new(distance: f64, basis: [[f64; 2]; 3]) -> Self {
        Self {
            distance: Some(distance),
            basis: Some(basis),
            corner: None,
        }
    }

    /// Returns `true` when no key is set.
    pub fn is_empty(&self) -> bool {
        self.distance.is_none() && self.basis.is_none() && self.corner.is_none()
    }

    /// Length of the two pixel basis vectors (m), if a basis is known.
    pub fn pixel_pitch(&self) -> Option<[f64; 2]> {
        let basis = self.basis?;
        let norm = |col: usize| {
            (0..3).map(|row| basis[row][col] * basis[row][col]).sum::<f64>().sqrt()
        };
        Some([norm(0), norm(1)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_keys_are_omitted() {
        let geometry = DetectorGeometry {
            distance: Some(0.7),
            ..Default::default()
        };
        let json = serde_json::to_string(&geometry).unwrap();
        assert_eq!(json, r#"{"distance":0.7}"#);

        let back: DetectorGeometry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, geometry);
        assert!(back.basis.is_none());
        assert!(back.corner.is_none());
    }

    #[test]
    fn test_pixel_pitch() {
        let geometry = DetectorGeometry::new(1.0, [[0.0, -30e-6], [-30e-6, 0.0], [0.0, 0.0]]);
        let pitch = geometry.pixel_pitch().unwrap();
        assert!((pitch[0] - 30e-6).abs() < 1e-15);
        assert!((pitch[1] - 30e-6).abs() < 1e-15);
        assert!(DetectorGeometry::default().is_empty());
    }
}
