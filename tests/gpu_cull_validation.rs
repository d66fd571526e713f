/// GPU Cull Validation Tests
///
/// Replays the same recorded frames on the wgpu executor and on the CPU
/// reference executor and compares what each left behind: the visible
/// meshlet counter, the compacted meshlet commands and the triangles in
/// every batch slot. Device output order is unspecified, so comparisons are
/// order-insensitive. Tests skip when no adapter is available.

use std::collections::BTreeSet;
use std::sync::Arc;

use cgmath::{Matrix4, Rad, Vector3};
use meshlet_cull::camera::{init_camera, look_at, CameraData};
use meshlet_cull::renderer::gpu_culling::{MeshletDrawCommand, PackedScene};
use meshlet_cull::{
    BufferSlice, CommandList, CullConfig, CullContext, CullError, CullLimits, CullPipeline, CullToggles,
    DrawIndexedIndirect, FrameSummary, GpuCullExecutor, Mesh, ReferenceExecutor, Scene, SceneBuffers, TextureDesc,
    TextureFormat,
};

const WIDTH: u32 = 64;
const HEIGHT: u32 = 32;

/// Initialize GPU context for tests
fn init_gpu() -> Option<(Arc<wgpu::Device>, Arc<wgpu::Queue>)> {
    let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });

    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::HighPerformance,
        compatible_surface: None,
        force_fallback_adapter: false,
    }))?;

    let (device, queue) = pollster::block_on(adapter.request_device(
        &wgpu::DeviceDescriptor {
            label: Some("GPU Test Device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
        },
        None,
    ))
    .ok()?;

    Some((Arc::new(device), Arc::new(queue)))
}

/// Everything a frame left in device memory that the comparison looks at
#[derive(Debug, PartialEq)]
struct FrameState {
    visible_meshlets: u32,
    commands: BTreeSet<(u32, u32, u32)>,
    triangles: Vec<(u32, [u32; 3])>,
}

fn frame_state(pipeline: &CullPipeline, summary: &FrameSummary, read: &dyn Fn(BufferSlice) -> Vec<u32>) -> FrameState {
    let cull_data = pipeline.cull_data();
    let visible_meshlets = read(cull_data.visible_meshlet_count(summary.frame_slot))[0];

    let words = read(cull_data.meshlet_commands());
    let commands: &[MeshletDrawCommand] = bytemuck::cast_slice(&words);
    let commands = commands[..visible_meshlets as usize]
        .iter()
        .map(|c| (c.first_instance, c.meshlet_index, c.flags))
        .collect();

    // The last batches of the frame, one per slot
    let batch_cull = pipeline.batch_cull();
    let mut triangles = Vec::new();
    for slot in 0..batch_cull.ring().depth() {
        let batch = batch_cull.batch(slot);
        let count = read(batch.draw_count())[0] as usize;
        let words = read(batch.final_draws());
        let draws: &[DrawIndexedIndirect] = bytemuck::cast_slice(&words);
        for draw in &draws[..count.min(draws.len())] {
            let indices = read(BufferSlice {
                buffer: batch.indices.buffer,
                offset: draw.first_index as u64 * 4,
                size: draw.index_count as u64 * 4,
            });
            triangles.extend(indices.chunks_exact(3).map(|t| (draw.first_instance, [t[0], t[1], t[2]])));
        }
    }
    triangles.sort_unstable();

    FrameState {
        visible_meshlets,
        commands,
        triangles,
    }
}

fn test_scene() -> Scene {
    let mut scene = Scene::new();
    let cube = scene.add_mesh(Mesh::cube(0.4));
    for column in 0..5 {
        let x = (column as f32 - 2.0) * 2.0;
        let transform = Matrix4::from_translation(Vector3::new(x, 0.3, -12.0))
            * Matrix4::from_angle_y(Rad(0.35 + column as f32 * 0.15))
            * Matrix4::from_angle_x(Rad(0.25));
        scene.add_object(cube, transform).expect("cube mesh is live");
    }
    let grid = scene.add_mesh(Mesh::grid(6, 1.5, 124));
    scene
        .add_object(
            grid,
            Matrix4::from_translation(Vector3::new(0.5, -2.0, -10.0)) * Matrix4::from_angle_x(Rad(-0.6)),
        )
        .expect("grid mesh is live");
    scene
}

fn test_config(toggles: CullToggles) -> CullConfig {
    CullConfig {
        limits: CullLimits {
            max_objects: 32,
            max_meshlets: 32,
            max_draw_indirect_calls: 4,
            ..CullLimits::default()
        },
        toggles,
    }
}

/// Record each frame once and run it on both executors
fn compare_frames(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>, config: &CullConfig, cameras: &[CameraData]) {
    let mut gpu = GpuCullExecutor::new(device, queue).expect("device meets the limits");
    let mut reference = ReferenceExecutor::new();

    let scene = test_scene();
    let packed: PackedScene = scene.pack().expect("scene packs");
    let mut ctx = CullContext::new();
    let buffers = SceneBuffers::create(&mut ctx, &packed, &config.limits).expect("scene fits the limits");
    assert!(buffers.meshlet_instances <= config.limits.max_command_count());
    let depth = ctx.resources.create_texture(TextureDesc {
        label: "depth target".to_string(),
        width: WIDTH,
        height: HEIGHT,
        mip_levels: 1,
        format: TextureFormat::Depth32Float,
        imported: true,
    });
    let mut pipeline =
        CullPipeline::new(&mut ctx, config, buffers, depth, gpu.max_texture_dimension()).expect("pipeline initializes");

    let mut list = CommandList::new();
    buffers.upload(&ctx, &packed, &mut list).expect("upload records");
    reference.submit(&ctx.resources, &list, |_, _| {}).expect("reference upload");
    gpu.submit(&ctx.resources, &list, |_, _, _| {}).expect("device upload");

    for (frame, camera) in cameras.iter().enumerate() {
        list.clear();
        let summary = pipeline
            .record_frame(&ctx, frame as u64, camera, &mut list)
            .expect("frame records");
        assert!(summary.batches.iter().all(|&b| b <= config.limits.batch_overlap));

        // Nothing rasterizes on either side: depth stays at the far plane
        reference.submit(&ctx.resources, &list, |_, _| {}).expect("reference frame");
        let mut consumed = 0;
        gpu.submit(&ctx.resources, &list, |_, _, _| consumed += 1)
            .expect("device frame");
        assert_eq!(consumed, summary.batches[0] + summary.batches[1]);

        let expected = frame_state(&pipeline, &summary, &|slice| reference.storage().read::<u32>(slice));
        let actual = frame_state(&pipeline, &summary, &|slice| gpu.read::<u32>(slice).expect("readback"));
        assert_eq!(actual, expected, "frame {} differs", frame);
    }

    pipeline.destroy(&mut ctx);
}

#[test]
fn test_gpu_frustum_and_backface_cull_matches_reference() {
    let Some((device, queue)) = init_gpu() else {
        println!("Skipping GPU test - no GPU available");
        return;
    };

    let toggles = CullToggles {
        occlusion: false,
        reocclusion: false,
        ..CullToggles::default()
    };
    compare_frames(device, queue, &test_config(toggles), &[init_camera(WIDTH, HEIGHT)]);
}

#[test]
fn test_gpu_two_pass_frames_match_reference() {
    let Some((device, queue)) = init_gpu() else {
        println!("Skipping GPU test - no GPU available");
        return;
    };

    let aspect = WIDTH as f32 / HEIGHT as f32;
    let cameras = [
        init_camera(WIDTH, HEIGHT),
        look_at(cgmath::Point3::new(0.7, 0.2, 0.0), cgmath::Point3::new(0.0, 0.0, -12.0), aspect),
        look_at(cgmath::Point3::new(-0.9, 0.5, 1.0), cgmath::Point3::new(0.5, -0.5, -12.0), aspect),
    ];
    compare_frames(device, queue, &test_config(CullToggles::default()), &cameras);
}

#[test]
fn test_gpu_import_requires_sampleable_texture() {
    let Some((device, queue)) = init_gpu() else {
        println!("Skipping GPU test - no GPU available");
        return;
    };

    let mut gpu = GpuCullExecutor::new(device.clone(), queue).expect("device meets the limits");
    let mut ctx = CullContext::new();
    let handle = ctx.resources.create_texture(TextureDesc {
        label: "depth target".to_string(),
        width: WIDTH,
        height: HEIGHT,
        mip_levels: 1,
        format: TextureFormat::Depth32Float,
        imported: true,
    });

    let attachment_only = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("attachment only depth"),
        size: wgpu::Extent3d {
            width: WIDTH,
            height: HEIGHT,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::Depth32Float,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
        view_formats: &[],
    });
    let result = gpu.import_texture(&ctx.resources, handle, attachment_only);
    assert!(matches!(result, Err(CullError::GpuOperationFailed { .. })));
}
