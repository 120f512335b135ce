//! Geometry
//!
//! Vertex attributes bound at fixed shader locations, an optional index
//! buffer, draw range, material groups and a cached bounding sphere.

use std::collections::BTreeMap;

use glam::{Mat4, Vec3};

use super::version_tracker::ChangeTracker;

/// Maximum number of morph targets a program can blend.
pub const MAX_MORPH_TARGETS: usize = 3;

/// Vertex attribute semantic. Each semantic owns a fixed location so any
/// program can consume any geometry without per-pair layout lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AttributeSemantic {
    Position,
    Normal,
    Uv,
    Color,
    Tangent,
    SkinIndex,
    SkinWeight,
    Uv1,
}

impl AttributeSemantic {
    #[must_use]
    pub fn location(self) -> u32 {
        match self {
            Self::Position => 0,
            Self::Normal => 1,
            Self::Uv => 2,
            Self::Color => 3,
            Self::Tangent => 4,
            Self::SkinIndex => 5,
            Self::SkinWeight => 6,
            Self::Uv1 => 7,
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Position => "position",
            Self::Normal => "normal",
            Self::Uv => "uv",
            Self::Color => "color",
            Self::Tangent => "tangent",
            Self::SkinIndex => "skinIndex",
            Self::SkinWeight => "skinWeight",
            Self::Uv1 => "uv1",
        }
    }
}

/// First location of the per-instance matrix (occupies four locations).
pub const INSTANCE_MATRIX_LOCATION: u32 = 8;
pub const INSTANCE_COLOR_LOCATION: u32 = 12;
/// Location of morph target 0; targets follow consecutively.
pub const MORPH_TARGET_LOCATION: u32 = 13;

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub data: Vec<f32>,
    /// Components per vertex (1..=4)
    pub item_size: u32,
    pub normalized: bool,
}

impl Attribute {
    #[must_use]
    pub fn new(data: Vec<f32>, item_size: u32) -> Self {
        Self {
            data,
            item_size,
            normalized: false,
        }
    }

    #[must_use]
    pub fn count(&self) -> u32 {
        if self.item_size == 0 {
            0
        } else {
            self.data.len() as u32 / self.item_size
        }
    }
}

/// A sub-range of the geometry drawn with one entry of a multi-material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GeometryGroup {
    pub start: u32,
    pub count: u32,
    pub material_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawRange {
    pub start: u32,
    /// `u32::MAX` draws to the end of the buffer
    pub count: u32,
}

impl Default for DrawRange {
    fn default() -> Self {
        Self {
            start: 0,
            count: u32::MAX,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BoundingSphere {
    pub center: Vec3,
    pub radius: f32,
}

impl BoundingSphere {
    /// Applies `matrix`, scaling the radius by its largest axis scale.
    #[must_use]
    pub fn transformed(&self, matrix: &Mat4) -> Self {
        let center = matrix.transform_point3(self.center);
        let max_scale = matrix
            .x_axis
            .truncate()
            .length_squared()
            .max(matrix.y_axis.truncate().length_squared())
            .max(matrix.z_axis.truncate().length_squared())
            .sqrt();
        Self {
            center,
            radius: self.radius * max_scale,
        }
    }

    /// Smallest sphere around `spheres`, centered on their mean.
    #[must_use]
    pub fn enclosing(spheres: impl Iterator<Item = BoundingSphere> + Clone) -> Option<Self> {
        let mut count = 0u32;
        let mut sum = Vec3::ZERO;
        for s in spheres.clone() {
            sum += s.center;
            count += 1;
        }
        if count == 0 {
            return None;
        }
        let center = sum / count as f32;
        let radius = spheres
            .map(|s| s.center.distance(center) + s.radius)
            .fold(0.0f32, f32::max);
        Some(Self { center, radius })
    }
}

#[derive(Debug, Clone)]
pub struct Geometry {
    pub name: String,
    pub topology: wgpu::PrimitiveTopology,
    pub draw_range: DrawRange,
    attributes: BTreeMap<AttributeSemantic, Attribute>,
    index: Option<Vec<u32>>,
    groups: Vec<GeometryGroup>,
    /// Position deltas, one attribute per target
    morph_targets: Vec<Attribute>,
    bounding_sphere: Option<BoundingSphere>,
    tracker: ChangeTracker,
}

impl Default for Geometry {
    fn default() -> Self {
        Self::new()
    }
}

impl Geometry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: "Geometry".to_string(),
            topology: wgpu::PrimitiveTopology::TriangleList,
            draw_range: DrawRange::default(),
            attributes: BTreeMap::new(),
            index: None,
            groups: Vec::new(),
            morph_targets: Vec::new(),
            bounding_sphere: None,
            tracker: ChangeTracker::new(),
        }
    }

    /// Builds a geometry from xyz positions and optional triangle indices.
    #[must_use]
    pub fn from_positions(positions: Vec<f32>, indices: Option<Vec<u32>>) -> Self {
        let mut geometry = Self::new();
        geometry.set_attribute(AttributeSemantic::Position, Attribute::new(positions, 3));
        if let Some(indices) = indices {
            geometry.set_index(indices);
        }
        geometry
    }

    pub fn set_attribute(&mut self, semantic: AttributeSemantic, attribute: Attribute) {
        self.attributes.insert(semantic, attribute);
        if semantic == AttributeSemantic::Position {
            self.compute_bounding_sphere();
        }
        self.tracker.changed();
    }

    #[must_use]
    pub fn with_attribute(mut self, semantic: AttributeSemantic, attribute: Attribute) -> Self {
        self.set_attribute(semantic, attribute);
        self
    }

    pub fn remove_attribute(&mut self, semantic: AttributeSemantic) -> Option<Attribute> {
        let removed = self.attributes.remove(&semantic);
        if removed.is_some() {
            self.tracker.changed();
        }
        removed
    }

    #[must_use]
    pub fn attribute(&self, semantic: AttributeSemantic) -> Option<&Attribute> {
        self.attributes.get(&semantic)
    }

    #[must_use]
    pub fn has_attribute(&self, semantic: AttributeSemantic) -> bool {
        self.attributes.contains_key(&semantic)
    }

    pub fn attributes(&self) -> impl Iterator<Item = (AttributeSemantic, &Attribute)> {
        self.attributes.iter().map(|(s, a)| (*s, a))
    }

    pub fn set_index(&mut self, indices: Vec<u32>) {
        self.index = Some(indices);
        self.tracker.changed();
    }

    #[must_use]
    pub fn index(&self) -> Option<&[u32]> {
        self.index.as_deref()
    }

    pub fn add_group(&mut self, start: u32, count: u32, material_index: u32) {
        self.groups.push(GeometryGroup {
            start,
            count,
            material_index,
        });
    }

    pub fn clear_groups(&mut self) {
        self.groups.clear();
    }

    #[must_use]
    pub fn groups(&self) -> &[GeometryGroup] {
        &self.groups
    }

    /// Adds a morph target of xyz position deltas. Targets past
    /// [`MAX_MORPH_TARGETS`] are ignored by the programs.
    pub fn add_morph_target(&mut self, deltas: Vec<f32>) {
        self.morph_targets.push(Attribute::new(deltas, 3));
        self.tracker.changed();
    }

    #[must_use]
    pub fn morph_targets(&self) -> &[Attribute] {
        &self.morph_targets
    }

    /// Number of morph targets a program will be compiled for.
    #[must_use]
    pub fn active_morph_targets(&self) -> usize {
        self.morph_targets.len().min(MAX_MORPH_TARGETS)
    }

    #[must_use]
    pub fn vertex_count(&self) -> u32 {
        self.attributes
            .get(&AttributeSemantic::Position)
            .map_or(0, Attribute::count)
    }

    /// Element count considered for drawing: indices when indexed, vertices
    /// otherwise.
    #[must_use]
    pub fn element_count(&self) -> u32 {
        self.index
            .as_ref()
            .map_or_else(|| self.vertex_count(), |i| i.len() as u32)
    }

    /// Intersects the draw range, an optional group range and the buffer
    /// extent. Returns `(first, count)`.
    #[must_use]
    pub fn draw_span(&self, group: Option<&GeometryGroup>) -> (u32, u32) {
        let total = self.element_count();
        let mut start = self.draw_range.start;
        let mut end = self.draw_range.start.saturating_add(self.draw_range.count);
        if let Some(group) = group {
            start = start.max(group.start);
            end = end.min(group.start.saturating_add(group.count));
        }
        end = end.min(total);
        if end <= start {
            (start, 0)
        } else {
            (start, end - start)
        }
    }

    /// Recomputes the sphere from positions: AABB center, max distance radius.
    pub fn compute_bounding_sphere(&mut self) {
        let Some(positions) = self.attributes.get(&AttributeSemantic::Position) else {
            self.bounding_sphere = None;
            return;
        };
        if positions.item_size < 3 || positions.data.len() < 3 {
            self.bounding_sphere = None;
            return;
        }

        let stride = positions.item_size as usize;
        let points = || {
            positions
                .data
                .chunks_exact(stride)
                .map(|c| Vec3::new(c[0], c[1], c[2]))
        };

        let (min, max) = points().fold(
            (Vec3::splat(f32::MAX), Vec3::splat(f32::MIN)),
            |(min, max), p| (min.min(p), max.max(p)),
        );
        let center = (min + max) * 0.5;
        let radius = points()
            .map(|p| p.distance_squared(center))
            .fold(0.0f32, f32::max)
            .sqrt();

        self.bounding_sphere = Some(BoundingSphere { center, radius });
    }

    #[must_use]
    pub fn bounding_sphere(&self) -> Option<BoundingSphere> {
        self.bounding_sphere
    }

    /// Marks the geometry dirty after direct edits.
    pub fn needs_update(&mut self) {
        self.tracker.changed();
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.tracker.version()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounding_sphere_from_positions() {
        let geometry = Geometry::from_positions(
            vec![-1.0, -1.0, 0.0, 1.0, -1.0, 0.0, 1.0, 1.0, 0.0, -1.0, 1.0, 0.0],
            Some(vec![0, 1, 2, 0, 2, 3]),
        );
        let sphere = geometry.bounding_sphere().unwrap();
        assert!(sphere.center.length() < 1e-6);
        assert!((sphere.radius - 2.0f32.sqrt()).abs() < 1e-5);
    }

    #[test]
    fn draw_span_clamps_to_group_and_buffer() {
        let mut geometry = Geometry::from_positions(vec![0.0; 18], None);
        assert_eq!(geometry.draw_span(None), (0, 6));

        geometry.add_group(3, 10, 1);
        let group = geometry.groups()[0];
        assert_eq!(geometry.draw_span(Some(&group)), (3, 3));

        geometry.draw_range = DrawRange { start: 4, count: 1 };
        assert_eq!(geometry.draw_span(Some(&group)), (4, 1));
    }

    #[test]
    fn transformed_sphere_uses_largest_scale() {
        let sphere = BoundingSphere {
            center: Vec3::ZERO,
            radius: 1.0,
        };
        let m = Mat4::from_scale_rotation_translation(
            Vec3::new(1.0, 3.0, 2.0),
            glam::Quat::IDENTITY,
            Vec3::new(5.0, 0.0, 0.0),
        );
        let t = sphere.transformed(&m);
        assert!((t.radius - 3.0).abs() < 1e-5);
        assert!((t.center - Vec3::new(5.0, 0.0, 0.0)).length() < 1e-5);
    }
}
