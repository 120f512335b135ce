//! Render Lists
//!
//! [`RenderListBuilder`] walks the scene for one camera and fills a
//! [`RenderList`]: culled, bucketed into opaque / transmissive / transparent
//! and sorted. Lists are keyed by camera identity in [`RenderLists`], so the
//! main camera, array sub-cameras and shadow cameras never share output.
//!
//! # Ordering
//!
//! | Bucket | Sort key |
//! |--------|----------|
//! | opaque, transmissive | group order, render order, material id, depth ascending, object id |
//! | transparent | group order, render order, depth descending, object id |
//!
//! Material identity ranks above depth for opaque draws so that draws sharing
//! a program and state stay adjacent.

use std::cmp::Ordering;

use glam::Mat4;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::resources::{
    BoundingSphere, GeometryGroup, GeometryHandle, Material, MaterialHandle, MaterialId,
};
use crate::scene::{Camera, CameraId, Frustum, MaterialSlot, Mesh, NodeHandle, Scene};

/// One draw: an object, a geometry range and the material to draw it with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawItem {
    /// Node id, the final sort tie-break
    pub id: u32,
    pub node: NodeHandle,
    pub geometry: GeometryHandle,
    pub material: MaterialHandle,
    pub material_id: MaterialId,
    pub group_order: i32,
    pub render_order: i32,
    /// Normalized device depth of the bounds center
    pub z: f32,
    /// Geometry group for multi-material meshes
    pub group: Option<GeometryGroup>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Opaque,
    Transmissive,
    Transparent,
}

impl Bucket {
    #[must_use]
    pub fn for_material(material: &Material) -> Self {
        if material.transmission() > 0.0 {
            Self::Transmissive
        } else if material.settings().transparent {
            Self::Transparent
        } else {
            Self::Opaque
        }
    }
}

/// Pooled, per-camera draw list.
///
/// Items live in an arena that only grows; each frame overwrites entries from
/// the start and nulls the unused tail in [`RenderList::finish`].
#[derive(Debug, Default)]
pub struct RenderList {
    arena: Vec<Option<DrawItem>>,
    used: usize,
    opaque: Vec<u32>,
    transmissive: Vec<u32>,
    transparent: Vec<u32>,
}

impl RenderList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new frame.
    pub fn init(&mut self) {
        self.used = 0;
        self.opaque.clear();
        self.transmissive.clear();
        self.transparent.clear();
    }

    pub fn push(&mut self, item: DrawItem, bucket: Bucket) {
        let index = self.used;
        if index < self.arena.len() {
            self.arena[index] = Some(item);
        } else {
            self.arena.push(Some(item));
        }
        self.used += 1;

        let index = index as u32;
        match bucket {
            Bucket::Opaque => self.opaque.push(index),
            Bucket::Transmissive => self.transmissive.push(index),
            Bucket::Transparent => self.transparent.push(index),
        }
    }

    /// Nulls arena entries left over from a larger previous frame.
    pub fn finish(&mut self) {
        for slot in &mut self.arena[self.used..] {
            *slot = None;
        }
    }

    /// Stable sort of all three buckets.
    pub fn sort(&mut self) {
        let arena = &self.arena;
        let item = |i: &u32| arena[*i as usize].as_ref();

        let opaque = |a: &u32, b: &u32| match (item(a), item(b)) {
            (Some(a), Some(b)) => painter_order(a, b),
            _ => Ordering::Equal,
        };
        let transparent = |a: &u32, b: &u32| match (item(a), item(b)) {
            (Some(a), Some(b)) => reverse_painter_order(a, b),
            _ => Ordering::Equal,
        };

        self.opaque.sort_by(opaque);
        self.transmissive.sort_by(opaque);
        self.transparent.sort_by(transparent);
    }

    fn resolve<'a>(&'a self, indices: &'a [u32]) -> impl Iterator<Item = &'a DrawItem> + 'a {
        indices
            .iter()
            .filter_map(|&i| self.arena.get(i as usize).and_then(Option::as_ref))
    }

    pub fn opaque(&self) -> impl Iterator<Item = &DrawItem> {
        self.resolve(&self.opaque)
    }

    pub fn transmissive(&self) -> impl Iterator<Item = &DrawItem> {
        self.resolve(&self.transmissive)
    }

    pub fn transparent(&self) -> impl Iterator<Item = &DrawItem> {
        self.resolve(&self.transparent)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.used
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Arena slots allocated so far.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.arena.len()
    }
}

fn painter_order(a: &DrawItem, b: &DrawItem) -> Ordering {
    a.group_order
        .cmp(&b.group_order)
        .then(a.render_order.cmp(&b.render_order))
        .then(a.material_id.cmp(&b.material_id))
        .then(a.z.total_cmp(&b.z))
        .then(a.id.cmp(&b.id))
}

fn reverse_painter_order(a: &DrawItem, b: &DrawItem) -> Ordering {
    a.group_order
        .cmp(&b.group_order)
        .then(a.render_order.cmp(&b.render_order))
        .then(b.z.total_cmp(&a.z))
        .then(a.id.cmp(&b.id))
}

/// Render lists keyed by camera identity.
///
/// Lists not touched since the last [`RenderLists::evict_unused`] are dropped
/// by it.
#[derive(Debug, Default)]
pub struct RenderLists {
    lists: FxHashMap<CameraId, RenderList>,
    used: FxHashSet<CameraId>,
}

impl RenderLists {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&mut self, camera: CameraId) -> &mut RenderList {
        self.used.insert(camera);
        self.lists.entry(camera).or_default()
    }

    #[must_use]
    pub fn peek(&self, camera: CameraId) -> Option<&RenderList> {
        self.lists.get(&camera)
    }

    /// Takes the list out so it can be read while the renderer is borrowed
    /// mutably. Pair with [`RenderLists::put`].
    pub fn take(&mut self, camera: CameraId) -> RenderList {
        self.lists.remove(&camera).unwrap_or_default()
    }

    pub fn put(&mut self, camera: CameraId, list: RenderList) {
        self.used.insert(camera);
        self.lists.insert(camera, list);
    }

    /// Drops every list not used since the previous call. Returns how many
    /// were dropped.
    pub fn evict_unused(&mut self) -> usize {
        let before = self.lists.len();
        let used = &self.used;
        self.lists.retain(|camera, _| used.contains(camera));
        self.used.clear();
        before - self.lists.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lists.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    pub fn dispose(&mut self) {
        self.lists.clear();
        self.used.clear();
    }
}

/// What a traversal collects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListFilter {
    /// Visible meshes for the main passes, bucketed by material.
    Main,
    /// Shadow-casting meshes, all in the opaque bucket.
    ShadowCasters,
}

/// Scene traversal into a [`RenderList`].
#[derive(Debug, Default)]
pub struct RenderListBuilder {
    stack: Vec<(NodeHandle, i32)>,
}

impl RenderListBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fills `list` for `camera`. World matrices must be current.
    pub fn build(
        &mut self,
        scene: &Scene,
        camera: &Camera,
        filter: ListFilter,
        sort: bool,
        list: &mut RenderList,
    ) {
        let view_projection = camera.view_projection_matrix();
        let frustum = Frustum::from_matrix(view_projection);

        list.init();
        self.stack.clear();
        self.stack.push((scene.root(), 0));

        while let Some((handle, inherited_group)) = self.stack.pop() {
            let Some(node) = scene.node(handle) else {
                continue;
            };
            if !node.visible {
                continue;
            }
            let group_order = node.group_order.unwrap_or(inherited_group);

            if let Some(mesh) = node.as_mesh() {
                let wanted = match filter {
                    ListFilter::Main => true,
                    ListFilter::ShadowCasters => node.cast_shadow,
                };
                if wanted && node.layers.test(camera.layers) {
                    let bounds = world_bounds(scene, mesh, node.world_matrix());
                    let in_view = !node.frustum_culled
                        || bounds.is_none_or(|s| frustum.intersects_sphere(s.center, s.radius));
                    if in_view {
                        let center = bounds.map_or_else(|| node.world_position(), |s| s.center);
                        let z = view_projection.project_point3(center).z;
                        push_mesh(scene, handle, mesh, group_order, z, filter, list);
                    }
                }
            }

            // Reverse so children pop in declaration order.
            for &child in node.children().iter().rev() {
                self.stack.push((child, group_order));
            }
        }

        list.finish();
        if sort {
            list.sort();
        }
    }
}

/// World-space bounds; instanced meshes enclose every instance.
fn world_bounds(
    scene: &Scene,
    mesh: &Mesh,
    world: Mat4,
) -> Option<BoundingSphere> {
    let local = scene.geometry(mesh.geometry)?.bounding_sphere()?;
    match &mesh.instances {
        Some(instances) if instances.count() > 0 => BoundingSphere::enclosing(
            instances
                .matrices()
                .iter()
                .map(move |m| local.transformed(&(world * *m))),
        ),
        _ => Some(local.transformed(&world)),
    }
}

fn push_mesh(
    scene: &Scene,
    node_handle: NodeHandle,
    mesh: &Mesh,
    group_order: i32,
    z: f32,
    filter: ListFilter,
    list: &mut RenderList,
) {
    let Some(node) = scene.node(node_handle) else {
        return;
    };
    let mut push = |material_handle: MaterialHandle, group: Option<GeometryGroup>| {
        let Some(material) = scene.material(material_handle) else {
            return;
        };
        if !material.settings().visible {
            return;
        }
        let bucket = match filter {
            ListFilter::Main => Bucket::for_material(material),
            ListFilter::ShadowCasters => Bucket::Opaque,
        };
        list.push(
            DrawItem {
                id: node.id(),
                node: node_handle,
                geometry: mesh.geometry,
                material: material_handle,
                material_id: material.id(),
                group_order,
                render_order: node.render_order,
                z,
                group,
            },
            bucket,
        );
    };

    match &mesh.material {
        MaterialSlot::Single(handle) => push(*handle, None),
        MaterialSlot::Multi(materials) => {
            let Some(geometry) = scene.geometry(mesh.geometry) else {
                return;
            };
            for group in geometry.groups() {
                if let Some(&handle) = materials.get(group.material_index as usize) {
                    push(handle, Some(*group));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::*;
    use crate::resources::{Geometry, MaterialKind, MaterialSettings};
    use crate::scene::Node;

    fn quad() -> Geometry {
        let mut g = Geometry::from_positions(
            vec![-1.0, -1.0, 0.0, 1.0, -1.0, 0.0, 1.0, 1.0, 0.0, -1.0, 1.0, 0.0],
            Some(vec![0, 1, 2, 0, 2, 3]),
        );
        g.compute_bounding_sphere();
        g
    }

    fn camera() -> Camera {
        let mut camera = Camera::new_perspective(60.0, 1.0, 0.1, 100.0);
        camera.look_at(Vec3::new(0.0, 0.0, 10.0), Vec3::ZERO, Vec3::Y);
        camera
    }

    fn transparent() -> Material {
        Material::new(MaterialKind::basic(Vec3::ONE)).with_settings(MaterialSettings {
            transparent: true,
            opacity: 0.5,
            ..Default::default()
        })
    }

    fn build(scene: &Scene, camera: &Camera) -> RenderList {
        let mut list = RenderList::new();
        RenderListBuilder::new().build(scene, camera, ListFilter::Main, true, &mut list);
        list
    }

    #[test]
    fn transparent_depth_is_non_increasing() {
        let mut scene = Scene::new();
        let geometry = scene.add_geometry(quad());
        let material = scene.add_material(transparent());
        for z in [-3.0, 2.0, -1.0, 0.5] {
            let node = Node::mesh(Mesh::new(geometry, material))
                .with_position(Vec3::new(0.0, 0.0, z));
            scene.add_node(node);
        }
        scene.update_world_matrices();

        let list = build(&scene, &camera());
        let depths: Vec<f32> = list.transparent().map(|i| i.z).collect();
        assert_eq!(depths.len(), 4);
        assert!(depths.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn opaque_groups_by_material_before_depth() {
        let mut scene = Scene::new();
        let geometry = scene.add_geometry(quad());
        let a = scene.add_material(Material::new(MaterialKind::basic(Vec3::X)));
        let b = scene.add_material(Material::new(MaterialKind::basic(Vec3::Y)));
        for (material, z) in [(b, 1.0), (a, -2.0), (b, -1.0), (a, 2.0)] {
            let node = Node::mesh(Mesh::new(geometry, material))
                .with_position(Vec3::new(0.0, 0.0, z));
            scene.add_node(node);
        }
        scene.update_world_matrices();

        let list = build(&scene, &camera());
        let order: Vec<MaterialHandle> = list.opaque().map(|i| i.material).collect();
        assert_eq!(order, vec![a, a, b, b]);
        let items: Vec<&DrawItem> = list.opaque().collect();
        assert!(items[0].z <= items[1].z);
    }

    #[test]
    fn invisible_subtree_is_skipped() {
        let mut scene = Scene::new();
        let geometry = scene.add_geometry(quad());
        let material = scene.add_material(Material::new(MaterialKind::basic(Vec3::ONE)));
        let mut group = Node::group();
        group.visible = false;
        let group = scene.add_node(group);
        let child = Node::mesh(Mesh::new(geometry, material));
        scene.add_to_parent(child, group);
        scene.update_world_matrices();

        assert!(build(&scene, &camera()).is_empty());
    }

    #[test]
    fn frustum_culling_respects_flag() {
        let mut scene = Scene::new();
        let geometry = scene.add_geometry(quad());
        let material = scene.add_material(Material::new(MaterialKind::basic(Vec3::ONE)));
        let behind = Node::mesh(Mesh::new(geometry, material))
            .with_position(Vec3::new(0.0, 0.0, 50.0));
        let handle = scene.add_node(behind);
        scene.update_world_matrices();
        assert!(build(&scene, &camera()).is_empty());

        if let Some(node) = scene.node_mut(handle) {
            node.frustum_culled = false;
        }
        assert_eq!(build(&scene, &camera()).len(), 1);
    }

    #[test]
    fn group_order_propagates_to_descendants() {
        let mut scene = Scene::new();
        let geometry = scene.add_geometry(quad());
        let material = scene.add_material(Material::new(MaterialKind::basic(Vec3::ONE)));
        let mut group = Node::group();
        group.group_order = Some(-5);
        let group = scene.add_node(group);
        scene.add_to_parent(Node::mesh(Mesh::new(geometry, material)), group);
        scene.add_node(Node::mesh(Mesh::new(geometry, material)));
        scene.update_world_matrices();

        let list = build(&scene, &camera());
        let orders: Vec<i32> = list.opaque().map(|i| i.group_order).collect();
        assert_eq!(orders, vec![-5, 0]);
    }

    #[test]
    fn multi_material_expands_per_group() {
        let mut scene = Scene::new();
        let mut geometry = quad();
        geometry.add_group(0, 3, 0);
        geometry.add_group(3, 3, 1);
        let geometry = scene.add_geometry(geometry);
        let a = scene.add_material(Material::new(MaterialKind::basic(Vec3::X)));
        let b = scene.add_material(transparent());
        scene.add_node(Node::mesh(Mesh::new_multi(geometry, vec![a, b])));
        scene.update_world_matrices();

        let list = build(&scene, &camera());
        assert_eq!(list.opaque().count(), 1);
        assert_eq!(list.transparent().count(), 1);
        assert_eq!(list.transparent().next().and_then(|i| i.group).map(|g| g.start), Some(3));
    }

    #[test]
    fn arena_is_reused_and_tail_nulled() {
        let mut scene = Scene::new();
        let geometry = scene.add_geometry(quad());
        let material = scene.add_material(Material::new(MaterialKind::basic(Vec3::ONE)));
        let handles: Vec<NodeHandle> = (0..3)
            .map(|_| scene.add_node(Node::mesh(Mesh::new(geometry, material))))
            .collect();
        scene.update_world_matrices();

        let camera = camera();
        let mut builder = RenderListBuilder::new();
        let mut list = RenderList::new();
        builder.build(&scene, &camera, ListFilter::Main, true, &mut list);
        assert_eq!(list.capacity(), 3);

        scene.remove_node(handles[0]);
        builder.build(&scene, &camera, ListFilter::Main, true, &mut list);
        assert_eq!(list.len(), 2);
        assert_eq!(list.capacity(), 3);
        assert_eq!(list.opaque().count(), 2);
    }

    #[test]
    fn layers_filter_objects() {
        let mut scene = Scene::new();
        let geometry = scene.add_geometry(quad());
        let material = scene.add_material(Material::new(MaterialKind::basic(Vec3::ONE)));
        let mut node = Node::mesh(Mesh::new(geometry, material));
        node.layers.set(3);
        scene.add_node(node);
        scene.update_world_matrices();

        let mut camera = camera();
        assert!(build(&scene, &camera).is_empty());
        camera.layers.enable(3);
        assert_eq!(build(&scene, &camera).len(), 1);
    }
}
