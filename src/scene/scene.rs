use glam::{Mat4, Vec3};
use slotmap::SlotMap;

use crate::resources::{
    Geometry, GeometryHandle, Material, MaterialHandle, Texture, TextureHandle,
};
use crate::scene::NodeHandle;
use crate::scene::light::Light;
use crate::scene::node::{Mesh, Node, NodeKind};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Fog {
    Linear { color: Vec3, near: f32, far: f32 },
    Exp2 { color: Vec3, density: f32 },
}

impl Fog {
    #[must_use]
    pub fn color(&self) -> Vec3 {
        match self {
            Self::Linear { color, .. } | Self::Exp2 { color, .. } => *color,
        }
    }
}

/// Retained scene: a node tree plus the geometry, material and texture
/// arenas its meshes reference.
#[derive(Debug)]
pub struct Scene {
    nodes: SlotMap<NodeHandle, Node>,
    root: NodeHandle,
    geometries: SlotMap<GeometryHandle, Geometry>,
    materials: SlotMap<MaterialHandle, Material>,
    textures: SlotMap<TextureHandle, Texture>,
    next_node_id: u32,

    /// Clear color override `[r, g, b, a]`
    pub background: Option<[f32; 4]>,
    pub fog: Option<Fog>,
    /// Replaces every mesh material when set
    pub override_material: Option<Material>,
}

impl Default for Scene {
    fn default() -> Self {
        Self::new()
    }
}

impl Scene {
    #[must_use]
    pub fn new() -> Self {
        let mut nodes = SlotMap::with_key();
        let root = nodes.insert(Node::group());
        Self {
            nodes,
            root,
            geometries: SlotMap::with_key(),
            materials: SlotMap::with_key(),
            textures: SlotMap::with_key(),
            next_node_id: 1,
            background: None,
            fog: None,
            override_material: None,
        }
    }

    #[must_use]
    pub fn root(&self) -> NodeHandle {
        self.root
    }

    // === Resources ===

    pub fn add_geometry(&mut self, geometry: Geometry) -> GeometryHandle {
        self.geometries.insert(geometry)
    }

    pub fn add_material(&mut self, material: Material) -> MaterialHandle {
        self.materials.insert(material)
    }

    pub fn add_texture(&mut self, texture: Texture) -> TextureHandle {
        self.textures.insert(texture)
    }

    #[must_use]
    pub fn geometry(&self, handle: GeometryHandle) -> Option<&Geometry> {
        self.geometries.get(handle)
    }

    pub fn geometry_mut(&mut self, handle: GeometryHandle) -> Option<&mut Geometry> {
        self.geometries.get_mut(handle)
    }

    #[must_use]
    pub fn material(&self, handle: MaterialHandle) -> Option<&Material> {
        self.materials.get(handle)
    }

    pub fn material_mut(&mut self, handle: MaterialHandle) -> Option<&mut Material> {
        self.materials.get_mut(handle)
    }

    /// Removes a material from the arena. Release its programs with
    /// [`Renderer::dispose_material`](crate::renderer::Renderer::dispose_material).
    pub fn remove_material(&mut self, handle: MaterialHandle) -> Option<Material> {
        self.materials.remove(handle)
    }

    #[must_use]
    pub fn texture(&self, handle: TextureHandle) -> Option<&Texture> {
        self.textures.get(handle)
    }

    pub fn texture_mut(&mut self, handle: TextureHandle) -> Option<&mut Texture> {
        self.textures.get_mut(handle)
    }

    // === Hierarchy ===

    /// Adds `node` as a child of the root.
    pub fn add_node(&mut self, node: Node) -> NodeHandle {
        self.add_to_parent(node, self.root)
    }

    pub fn add_to_parent(&mut self, mut node: Node, parent: NodeHandle) -> NodeHandle {
        let parent = if self.nodes.contains_key(parent) {
            parent
        } else {
            log::warn!("Parent node not found, attaching to scene root");
            self.root
        };

        node.id = self.next_node_id;
        self.next_node_id += 1;
        node.parent = Some(parent);
        node.children.clear();

        let handle = self.nodes.insert(node);
        if let Some(p) = self.nodes.get_mut(parent) {
            p.children.push(handle);
        }
        handle
    }

    pub fn add_mesh(&mut self, geometry: GeometryHandle, material: MaterialHandle) -> NodeHandle {
        self.add_node(Node::mesh(Mesh::new(geometry, material)))
    }

    pub fn add_light(&mut self, light: Light) -> NodeHandle {
        self.add_node(Node::light(light))
    }

    /// Moves `child` under `parent`.
    pub fn attach(&mut self, child: NodeHandle, parent: NodeHandle) {
        if child == parent || child == self.root {
            log::warn!("Cannot attach node to itself or re-parent the root");
            return;
        }
        if !self.nodes.contains_key(parent) {
            log::error!("Parent node not found during attach");
            return;
        }

        let old_parent = self.nodes.get(child).and_then(Node::parent);
        if let Some(p) = old_parent
            && let Some(n) = self.nodes.get_mut(p)
        {
            n.children.retain(|&c| c != child);
        }

        if let Some(p) = self.nodes.get_mut(parent) {
            p.children.push(child);
        }
        if let Some(c) = self.nodes.get_mut(child) {
            c.parent = Some(parent);
        }
    }

    /// Removes `handle` and its subtree.
    pub fn remove_node(&mut self, handle: NodeHandle) {
        if handle == self.root {
            return;
        }
        let Some(node) = self.nodes.get(handle) else {
            return;
        };
        let children = node.children.clone();
        let parent = node.parent;

        for child in children {
            self.remove_node(child);
        }
        if let Some(p) = parent
            && let Some(n) = self.nodes.get_mut(p)
        {
            n.children.retain(|&c| c != handle);
        }
        self.nodes.remove(handle);
    }

    #[must_use]
    pub fn node(&self, handle: NodeHandle) -> Option<&Node> {
        self.nodes.get(handle)
    }

    pub fn node_mut(&mut self, handle: NodeHandle) -> Option<&mut Node> {
        self.nodes.get_mut(handle)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeHandle, &Node)> {
        self.nodes.iter()
    }

    /// Recomputes world matrices from local matrices, parents first.
    pub fn update_world_matrices(&mut self) {
        let mut stack: Vec<(NodeHandle, Mat4)> = vec![(self.root, Mat4::IDENTITY)];
        while let Some((handle, parent_world)) = stack.pop() {
            let Some(node) = self.nodes.get_mut(handle) else {
                continue;
            };
            node.world_matrix = parent_world * node.local_matrix;
            let world = node.world_matrix;
            for &child in node.children.iter().rev() {
                stack.push((child, world));
            }
        }
    }

    /// Visible light nodes, in tree order.
    pub fn lights(&self) -> impl Iterator<Item = (NodeHandle, &Node, &Light)> {
        let mut out = Vec::new();
        self.visit_visible(self.root, &mut |handle, node| {
            if let NodeKind::Light(light) = &node.kind {
                out.push((handle, node, light));
            }
        });
        out.into_iter()
    }

    fn visit_visible<'a>(
        &'a self,
        handle: NodeHandle,
        f: &mut dyn FnMut(NodeHandle, &'a Node),
    ) {
        let Some(node) = self.nodes.get(handle) else {
            return;
        };
        if !node.visible {
            return;
        }
        f(handle, node);
        for &child in &node.children {
            self.visit_visible(child, f);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn world_matrices_follow_hierarchy() {
        let mut scene = Scene::new();
        let parent = scene.add_node(Node::group().with_position(Vec3::new(1.0, 0.0, 0.0)));
        let child = Node::group().with_position(Vec3::new(0.0, 2.0, 0.0));
        let child = scene.add_to_parent(child, parent);
        scene.update_world_matrices();

        let pos = scene.node(child).unwrap().world_position();
        assert!((pos - Vec3::new(1.0, 2.0, 0.0)).length() < 1e-6);
    }

    #[test]
    fn remove_node_drops_subtree() {
        let mut scene = Scene::new();
        let parent = scene.add_node(Node::group());
        let child = scene.add_to_parent(Node::group(), parent);
        scene.remove_node(parent);

        assert!(scene.node(parent).is_none());
        assert!(scene.node(child).is_none());
        assert!(scene.node(scene.root()).unwrap().children().is_empty());
    }

    #[test]
    fn node_ids_are_unique_and_increasing() {
        let mut scene = Scene::new();
        let a = scene.add_node(Node::group());
        let b = scene.add_node(Node::group());
        assert!(scene.node(a).unwrap().id() < scene.node(b).unwrap().id());
    }

    #[test]
    fn lights_skip_invisible_subtrees() {
        let mut scene = Scene::new();
        let hidden = scene.add_node(Node::group());
        scene.node_mut(hidden).unwrap().visible = false;
        scene.add_to_parent(Node::light(Light::new_ambient(Vec3::ONE, 1.0)), hidden);
        scene.add_light(Light::new_directional(Vec3::ONE, 1.0));

        assert_eq!(scene.lights().count(), 1);
    }
}
