//! Cull stress run
//!
//! Builds a seeded random scene, runs the full two-pass pipeline on the CPU
//! reference executor with a software rasterizer as the batch consumer, and
//! optionally replays the same frames on the first wgpu adapter.
//!
//! Usage: cull_stress [config.toml] [--frames N] [--seed N] [--gpu]

use std::sync::Arc;

use anyhow::Context;
use cgmath::{Matrix4, Point3, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use meshlet_cull::camera::{build_projection_matrix, build_view_matrix, look_at, CameraData};
use meshlet_cull::renderer::gpu_culling::PackedScene;
use meshlet_cull::{
    CommandList, CullConfig, CullContext, CullLimits, CullPipeline, GpuCullExecutor, Mesh, ReferenceExecutor, Scene,
    SceneBuffers, TextureDesc, TextureFormat, TextureHandle,
};

const WIDTH: u32 = 256;
const HEIGHT: u32 = 144;

struct Options {
    config: CullConfig,
    frames: u64,
    seed: u64,
    gpu: bool,
}

fn parse_options() -> anyhow::Result<Options> {
    let mut options = Options {
        config: CullConfig {
            limits: CullLimits {
                max_objects: 1024,
                max_meshlets: 8192,
                max_draw_indirect_calls: 256,
                ..CullLimits::default()
            },
            ..CullConfig::default()
        },
        frames: 8,
        seed: 7,
        gpu: false,
    };

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--frames" => options.frames = args.next().context("--frames needs a value")?.parse()?,
            "--seed" => options.seed = args.next().context("--seed needs a value")?.parse()?,
            "--gpu" => options.gpu = true,
            path => {
                options.config =
                    CullConfig::load(path).with_context(|| format!("failed to load config from {}", path))?;
            }
        }
    }
    Ok(options)
}

/// Cubes and bumpy grids scattered in a box in front of the origin
fn build_scene(rng: &mut StdRng, limits: &CullLimits) -> anyhow::Result<Scene> {
    let mut scene = Scene::new();
    let cube = scene.add_mesh(Mesh::cube(0.5));
    let grid = scene.add_mesh(Mesh::grid(12, 2.0, limits.meshlet_max_triangles));

    let grid_meshlets = scene.meshes.get(grid).map(|m| m.meshlets.len() as u32).unwrap_or(1);
    let mut meshlets = 0u32;
    for _ in 0..limits.max_objects {
        let use_grid = rng.gen_bool(0.25);
        let cost = if use_grid { grid_meshlets } else { 1 };
        if meshlets + cost > limits.max_meshlets {
            break;
        }
        meshlets += cost;

        let position = Vector3::new(
            rng.gen_range(-30.0..30.0),
            rng.gen_range(-8.0..8.0),
            rng.gen_range(-80.0..-4.0),
        );
        let rotation = Matrix4::from_angle_y(cgmath::Rad(rng.gen_range(0.0..std::f32::consts::TAU)));
        let mesh = if use_grid { grid } else { cube };
        scene.add_object(mesh, Matrix4::from_translation(position) * rotation)?;
    }
    Ok(scene)
}

fn camera_for_frame(frame: u64) -> CameraData {
    let angle = frame as f32 * 0.05;
    let position = Point3::new(angle.sin() * 4.0, 1.0, 0.0);
    let target = Point3::new(angle.sin() * 2.0, 0.0, -40.0);
    look_at(position, target, WIDTH as f32 / HEIGHT as f32)
}

fn view_projection(camera: &CameraData) -> Matrix4<f32> {
    build_projection_matrix(camera) * build_view_matrix(camera)
}

fn depth_target(ctx: &mut CullContext) -> TextureHandle {
    ctx.resources.create_texture(TextureDesc {
        label: "depth target".to_string(),
        width: WIDTH,
        height: HEIGHT,
        mip_levels: 1,
        format: TextureFormat::Depth32Float,
        imported: true,
    })
}

fn run_reference(options: &Options, packed: &PackedScene) -> anyhow::Result<()> {
    let mut ctx = CullContext::new();
    let scene = SceneBuffers::create(&mut ctx, packed, &options.config.limits)?;
    let depth = depth_target(&mut ctx);
    let mut pipeline = CullPipeline::new(&mut ctx, &options.config, scene, depth, 4096)?;
    let mut executor = ReferenceExecutor::new();

    let mut list = CommandList::new();
    scene.upload(&ctx, packed, &mut list)?;
    executor.submit(&ctx.resources, &list, |_, _| {})?;

    for frame in 0..options.frames {
        let camera = camera_for_frame(frame);
        let view_proj = view_projection(&camera);

        list.clear();
        let summary = pipeline.record_frame(&ctx, frame, &camera, &mut list)?;
        executor.storage_mut().clear_depth(&ctx.resources, depth)?;
        executor.reset_stats();

        let mut drawn = 0u32;
        let mut raster_error = None;
        executor.submit(&ctx.resources, &list, |storage, consume| {
            match storage.rasterize(&ctx.resources, consume, &scene, view_proj) {
                Ok(count) => drawn += count,
                Err(e) => raster_error = Some(e),
            }
        })?;
        if let Some(e) = raster_error {
            return Err(e.into());
        }

        let stats = executor.stats();
        log::info!(
            "[cull_stress] frame {} slot {}: batches {:?}, meshes {:?}/{:?}, meshlets {:?}/{:?}, triangles {:?}/{:?}, rasterized {}",
            frame,
            summary.frame_slot,
            summary.batches,
            stats.meshes_visible,
            stats.mesh_tests,
            stats.meshlets_emitted,
            stats.meshlet_tests,
            stats.triangles_emitted,
            stats.triangles_tested,
            drawn
        );
    }

    pipeline.destroy(&mut ctx);
    Ok(())
}

fn request_device() -> Option<(Arc<wgpu::Device>, Arc<wgpu::Queue>)> {
    let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });
    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::HighPerformance,
        compatible_surface: None,
        force_fallback_adapter: false,
    }))?;
    log::info!("[cull_stress] adapter: {}", adapter.get_info().name);

    let (device, queue) = pollster::block_on(adapter.request_device(
        &wgpu::DeviceDescriptor {
            label: Some("Cull Stress Device"),
            required_features: wgpu::Features::empty(),
            required_limits: adapter.limits(),
        },
        None,
    ))
    .ok()?;
    Some((Arc::new(device), Arc::new(queue)))
}

/// Same frames on the device. Nothing rasterizes, so the depth target stays
/// at the far plane and only frustum, cone and backface tests reject.
fn run_gpu(options: &Options, packed: &PackedScene) -> anyhow::Result<()> {
    let Some((device, queue)) = request_device() else {
        log::warn!("[cull_stress] no adapter available, skipping the device run");
        return Ok(());
    };
    let mut executor = GpuCullExecutor::new(device, queue)?;

    let mut ctx = CullContext::new();
    let scene = SceneBuffers::create(&mut ctx, packed, &options.config.limits)?;
    let depth = depth_target(&mut ctx);
    let mut pipeline = CullPipeline::new(&mut ctx, &options.config, scene, depth, executor.max_texture_dimension())?;

    let mut list = CommandList::new();
    scene.upload(&ctx, packed, &mut list)?;
    executor.submit(&ctx.resources, &list, |_, _, _| {})?;

    for frame in 0..options.frames {
        let camera = camera_for_frame(frame);
        list.clear();
        let summary = pipeline.record_frame(&ctx, frame, &camera, &mut list)?;

        let mut consumed = 0u32;
        executor.submit(&ctx.resources, &list, |_, _, _| consumed += 1)?;

        let visible = executor.read::<u32>(pipeline.cull_data().visible_meshlet_count(summary.frame_slot))?;
        log::info!(
            "[cull_stress] device frame {}: {} batches consumed, meshlet counter {}",
            frame,
            consumed,
            visible.first().copied().unwrap_or(0)
        );
    }

    pipeline.destroy(&mut ctx);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let options = parse_options()?;
    options.config.limits.validate()?;

    let mut rng = StdRng::seed_from_u64(options.seed);
    let scene = build_scene(&mut rng, &options.config.limits)?;
    let packed = scene.pack()?;
    log::info!(
        "[cull_stress] seed {}: {} objects, {} meshlet instances, {} frames",
        options.seed,
        packed.objects.len(),
        packed.meshlet_instances,
        options.frames
    );

    run_reference(&options, &packed)?;
    if options.gpu {
        run_gpu(&options, &packed)?;
    }
    Ok(())
}
