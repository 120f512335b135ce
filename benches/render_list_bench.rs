use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use glam::{Mat4, Vec3};

use myth_forward::renderer::render_list::ListFilter;
use myth_forward::renderer::{HeadlessDevice, RenderList, RenderListBuilder, Renderer};
use myth_forward::resources::{Geometry, Material, MaterialKind};
use myth_forward::scene::{Camera, Scene};

/// Grid of `n * n` quads; every fourth material is transparent.
fn grid_scene(n: usize) -> Scene {
    let mut scene = Scene::new();
    let mut quad = Geometry::from_positions(
        vec![-0.4, -0.4, 0.0, 0.4, -0.4, 0.0, 0.4, 0.4, 0.0, -0.4, 0.4, 0.0],
        Some(vec![0, 1, 2, 0, 2, 3]),
    );
    quad.compute_bounding_sphere();
    let quad = scene.add_geometry(quad);

    let materials: Vec<_> = (0..8)
        .map(|i| {
            let mut material = Material::new(MaterialKind::basic(Vec3::splat(i as f32 / 8.0)));
            material.settings_mut().transparent = i % 4 == 0;
            scene.add_material(material)
        })
        .collect();

    for i in 0..n * n {
        let node = scene.add_mesh(quad, materials[i % materials.len()]);
        let (x, y) = ((i % n) as f32, (i / n) as f32);
        if let Some(node) = scene.node_mut(node) {
            node.local_matrix =
                Mat4::from_translation(Vec3::new(x - n as f32 / 2.0, y - n as f32 / 2.0, -x));
        }
    }
    scene.update_world_matrices();
    scene
}

fn camera() -> Camera {
    let mut camera = Camera::new_perspective(60.0, 1.0, 0.1, 500.0);
    camera.look_at(Vec3::new(0.0, 0.0, 60.0), Vec3::ZERO, Vec3::Y);
    camera
}

// ---------------------------------------------------------------------------
// Render list construction
// ---------------------------------------------------------------------------

fn bench_build_sorted(c: &mut Criterion) {
    let scene = grid_scene(64);
    let camera = camera();
    let mut builder = RenderListBuilder::new();
    let mut list = RenderList::new();

    c.bench_function("render_list_build_4096_sorted", |b| {
        b.iter(|| {
            builder.build(&scene, &camera, ListFilter::Main, true, &mut list);
            black_box(list.len());
        });
    });
}

fn bench_build_unsorted(c: &mut Criterion) {
    let scene = grid_scene(64);
    let camera = camera();
    let mut builder = RenderListBuilder::new();
    let mut list = RenderList::new();

    c.bench_function("render_list_build_4096_unsorted", |b| {
        b.iter(|| {
            builder.build(&scene, &camera, ListFilter::Main, false, &mut list);
            black_box(list.len());
        });
    });
}

// ---------------------------------------------------------------------------
// Full frames on the recording device
// ---------------------------------------------------------------------------

fn bench_frame(c: &mut Criterion) {
    let mut scene = grid_scene(16);
    let camera = camera();
    let mut renderer = Renderer::new(HeadlessDevice::new(256, 256), Default::default())
        .expect("default settings are valid");

    c.bench_function("frame_256_quads", |b| {
        b.iter(|| {
            renderer.render(&mut scene, &camera);
            renderer.device_mut().clear_commands();
            black_box(renderer.info().draw_calls);
        });
    });
}

criterion_group!(benches, bench_build_sorted, bench_build_unsorted, bench_frame);
criterion_main!(benches);
