use glam::Vec3;

/// Shadow-map configuration of a light. Present only on lights that can cast
/// shadows (directional, spot, point); casting is switched by the node's
/// `cast_shadow` flag.
#[derive(Debug, Clone, PartialEq)]
pub struct LightShadow {
    /// Edge length of one shadow face in texels
    pub map_size: u32,
    pub bias: f32,
    pub normal_bias: f32,
    /// PCF kernel radius
    pub radius: f32,
    pub camera_near: f32,
    /// `0.0` uses the light distance (spot/point) or 500 (directional)
    pub camera_far: f32,
    /// Half extent of the orthographic shadow camera (directional only)
    pub ortho_extent: f32,
}

impl Default for LightShadow {
    fn default() -> Self {
        Self {
            map_size: 512,
            bias: 0.0,
            normal_bias: 0.0,
            radius: 1.0,
            camera_near: 0.5,
            camera_far: 0.0,
            ortho_extent: 5.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LightKind {
    Ambient,
    /// Sky color is the light color; the direction points from the origin
    /// towards the light position.
    Hemisphere { ground_color: Vec3 },
    /// Shines from the light position towards `target` (world space).
    Directional { target: Vec3 },
    Point {
        /// `0.0` means infinite range
        distance: f32,
        decay: f32,
    },
    Spot {
        target: Vec3,
        distance: f32,
        /// Half angle of the cone in radians
        angle: f32,
        /// `0..=1` fraction of the cone that is attenuated
        penumbra: f32,
        decay: f32,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Light {
    pub color: Vec3,
    pub intensity: f32,
    pub kind: LightKind,
    pub shadow: Option<LightShadow>,
}

impl Light {
    #[must_use]
    pub fn new_ambient(color: Vec3, intensity: f32) -> Self {
        Self {
            color,
            intensity,
            kind: LightKind::Ambient,
            shadow: None,
        }
    }

    #[must_use]
    pub fn new_hemisphere(sky: Vec3, ground: Vec3, intensity: f32) -> Self {
        Self {
            color: sky,
            intensity,
            kind: LightKind::Hemisphere {
                ground_color: ground,
            },
            shadow: None,
        }
    }

    #[must_use]
    pub fn new_directional(color: Vec3, intensity: f32) -> Self {
        Self {
            color,
            intensity,
            kind: LightKind::Directional { target: Vec3::ZERO },
            shadow: Some(LightShadow::default()),
        }
    }

    #[must_use]
    pub fn new_point(color: Vec3, intensity: f32, distance: f32) -> Self {
        Self {
            color,
            intensity,
            kind: LightKind::Point {
                distance,
                decay: 2.0,
            },
            shadow: Some(LightShadow::default()),
        }
    }

    #[must_use]
    pub fn new_spot(color: Vec3, intensity: f32, distance: f32, angle: f32, penumbra: f32) -> Self {
        Self {
            color,
            intensity,
            kind: LightKind::Spot {
                target: Vec3::ZERO,
                distance,
                angle,
                penumbra,
                decay: 2.0,
            },
            shadow: Some(LightShadow::default()),
        }
    }

    #[must_use]
    pub fn can_cast_shadow(&self) -> bool {
        self.shadow.is_some()
            && matches!(
                self.kind,
                LightKind::Directional { .. } | LightKind::Point { .. } | LightKind::Spot { .. }
            )
    }
}
