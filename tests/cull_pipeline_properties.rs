/// Cull Pipeline Property Tests
///
/// Runs whole frames on the CPU reference executor, with its software
/// rasterizer consuming every batch, and checks the pipeline-level
/// guarantees: conservation of visible meshlets, idempotence, batching,
/// reocclusion, capacity boundaries, ring reuse, barrier discipline and the
/// depth pyramid reduction.

use std::collections::BTreeSet;

use cgmath::{Matrix4, Point3, Rad, Vector3};
use meshlet_cull::camera::{build_projection_matrix, build_view_matrix, init_camera, look_at, CameraData};
use meshlet_cull::constants::flags;
use meshlet_cull::renderer::gpu_culling::depth_pyramid::reduce_footprint;
use meshlet_cull::renderer::gpu_culling::{
    pyramid_dimensions, CullOp, HazardTracker, Kernel, MeshletDrawCommand, PackedScene,
};
use meshlet_cull::{
    BufferSlice, CommandList, Consume, CullConfig, CullContext, CullError, CullLimits, CullPass, CullPipeline,
    CullToggles, DrawIndexedIndirect, FrameSummary, Mesh, ReferenceExecutor, ReferenceStorage, Scene,
    SceneBuffers, TextureDesc, TextureFormat, TextureHandle,
};

const WIDTH: u32 = 64;
const HEIGHT: u32 = 32;

/// What the rasterizer received for one batch
#[derive(Debug, Clone)]
struct BatchOutput {
    pass: CullPass,
    ring_slot: u32,
    draws: Vec<DrawIndexedIndirect>,
    /// (object, global vertex indices) per drawn triangle
    triangles: Vec<(u32, [u32; 3])>,
}

fn batch_output(storage: &ReferenceStorage, consume: &Consume) -> BatchOutput {
    let draws = storage.consumed_draws(consume);
    let index_buffer = consume.source.index_buffer.buffer;
    let mut triangles = Vec::new();
    for draw in &draws {
        let indices: Vec<u32> = storage.read(BufferSlice {
            buffer: index_buffer,
            offset: draw.first_index as u64 * 4,
            size: draw.index_count as u64 * 4,
        });
        triangles.extend(indices.chunks_exact(3).map(|t| (draw.first_instance, [t[0], t[1], t[2]])));
    }
    BatchOutput {
        pass: consume.pass,
        ring_slot: consume.ring_slot,
        draws,
        triangles,
    }
}

fn sorted_triangles<'a>(batches: impl IntoIterator<Item = &'a BatchOutput>) -> Vec<(u32, [u32; 3])> {
    let mut triangles: Vec<_> = batches.into_iter().flat_map(|b| b.triangles.iter().copied()).collect();
    triangles.sort_unstable();
    triangles
}

struct Harness {
    ctx: CullContext,
    scene: SceneBuffers,
    depth: TextureHandle,
    pipeline: CullPipeline,
    executor: ReferenceExecutor,
}

impl Harness {
    fn new(scene: &Scene, config: &CullConfig) -> Self {
        Self::with_target(scene, config, WIDTH, HEIGHT)
    }

    fn with_target(scene: &Scene, config: &CullConfig, width: u32, height: u32) -> Self {
        let packed: PackedScene = scene.pack().expect("scene packs");
        let mut ctx = CullContext::new();
        let buffers = SceneBuffers::create(&mut ctx, &packed, &config.limits).expect("scene fits the limits");
        let depth = ctx.resources.create_texture(TextureDesc {
            label: "depth target".to_string(),
            width,
            height,
            mip_levels: 1,
            format: TextureFormat::Depth32Float,
            imported: true,
        });
        let pipeline = CullPipeline::new(&mut ctx, config, buffers, depth, 4096).expect("pipeline initializes");

        let mut executor = ReferenceExecutor::new();
        let mut list = CommandList::new();
        buffers.upload(&ctx, &packed, &mut list).expect("upload records");
        executor.submit(&ctx.resources, &list, |_, _| {}).expect("upload executes");

        Self {
            ctx,
            scene: buffers,
            depth,
            pipeline,
            executor,
        }
    }

    fn record(&mut self, frame: u64, camera: &CameraData) -> (CommandList, FrameSummary) {
        let mut list = CommandList::new();
        let summary = self
            .pipeline
            .record_frame(&self.ctx, frame, camera, &mut list)
            .expect("frame records");
        (list, summary)
    }

    /// Execute a recorded frame against a cleared depth target
    fn submit(&mut self, list: &CommandList, camera: &CameraData) -> Result<Vec<BatchOutput>, CullError> {
        let view_proj = build_projection_matrix(camera) * build_view_matrix(camera);
        let registry = &self.ctx.resources;
        let scene = self.scene;
        self.executor.storage_mut().clear_depth(registry, self.depth)?;
        self.executor.reset_stats();

        let mut batches = Vec::new();
        self.executor.submit(registry, list, |storage, consume| {
            batches.push(batch_output(storage, consume));
            storage
                .rasterize(registry, consume, &scene, view_proj)
                .expect("consumed batch rasterizes");
        })?;
        Ok(batches)
    }

    fn frame(&mut self, frame: u64, camera: &CameraData) -> (FrameSummary, Vec<BatchOutput>) {
        let (list, summary) = self.record(frame, camera);
        let batches = self.submit(&list, camera).expect("frame executes");
        (summary, batches)
    }

    fn storage(&self) -> &ReferenceStorage {
        self.executor.storage()
    }

    fn visible_meshlet_count(&self, slot: u32) -> u32 {
        self.storage()
            .read_u32(self.pipeline.cull_data().visible_meshlet_count(slot))
    }

    fn meshlet_commands(&self, slot: u32) -> Vec<MeshletDrawCommand> {
        let count = self.visible_meshlet_count(slot) as usize;
        let mut commands: Vec<MeshletDrawCommand> = self.storage().read(self.pipeline.cull_data().meshlet_commands());
        commands.truncate(count);
        commands
    }

    fn mesh_visibility(&self) -> Vec<u32> {
        self.storage().read(self.pipeline.cull_data().mesh_visibility())
    }
}

fn config(calls: u32, toggles: CullToggles) -> CullConfig {
    CullConfig {
        limits: CullLimits {
            max_objects: 64,
            max_meshlets: 64,
            max_draw_indirect_calls: calls,
            ..CullLimits::default()
        },
        toggles,
    }
}

fn toggles(occlusion: bool, triangles: bool, reocclusion: bool) -> CullToggles {
    CullToggles {
        frustum: true,
        occlusion,
        cone: true,
        triangles,
        reocclusion,
    }
}

/// `columns` x `rows` cubes on a plane at `z`, two units apart, slightly turned
fn cube_grid(scene: &mut Scene, columns: u32, rows: u32, z: f32) {
    let cube = scene.add_mesh(Mesh::cube(0.4));
    for row in 0..rows {
        for column in 0..columns {
            let x = (column as f32 - (columns - 1) as f32 * 0.5) * 2.0;
            let y = (row as f32 - (rows - 1) as f32 * 0.5) * 2.0;
            let transform = Matrix4::from_translation(Vector3::new(x, y, z))
                * Matrix4::from_angle_y(Rad(0.4 + column as f32 * 0.1))
                * Matrix4::from_angle_x(Rad(0.3));
            scene.add_object(cube, transform).expect("cube mesh is live");
        }
    }
}

fn front_camera() -> CameraData {
    init_camera(WIDTH, HEIGHT)
}

#[test]
fn visible_meshlet_count_matches_compacted_batches() {
    let mut scene = Scene::new();
    cube_grid(&mut scene, 4, 2, -15.0);
    let grid = scene.add_mesh(Mesh::grid(8, 1.0, 124));
    scene
        .add_object(grid, Matrix4::from_translation(Vector3::new(-3.0, 0.0, -12.0)))
        .expect("grid mesh is live");
    // Behind the camera
    let cube = scene.add_mesh(Mesh::cube(0.5));
    for x in [-2.0, 0.0, 2.0] {
        scene
            .add_object(cube, Matrix4::from_translation(Vector3::new(x, 0.0, 15.0)))
            .expect("cube mesh is live");
    }
    let object_count = scene.objects.len() as u32;

    let mut harness = Harness::new(&scene, &config(16, toggles(false, false, false)));
    let (summary, batches) = harness.frame(0, &front_camera());

    let visible = harness.visible_meshlet_count(summary.frame_slot);
    let compacted: usize = batches.iter().map(|b| b.draws.len()).sum();
    assert!(visible > 0);
    assert_eq!(compacted as u32, visible);
    assert_eq!(harness.executor.stats().meshlets_emitted[0], visible as u64);

    // Pass-through triangle cull keeps every index of every command
    let commands = harness.meshlet_commands(summary.frame_slot);
    let command_indices: u32 = commands.iter().map(|c| c.index_count).sum();
    let drawn_indices: u32 = batches.iter().flat_map(|b| &b.draws).map(|d| d.index_count).sum();
    assert_eq!(command_indices, drawn_indices);

    let mesh_flags = harness.mesh_visibility();
    for draw in batches.iter().flat_map(|b| &b.draws) {
        assert_ne!(mesh_flags[draw.first_instance as usize] & flags::MESH_VISIBLE, 0);
        assert!(draw.first_instance < object_count - 3, "object behind the camera was drawn");
    }
}

#[test]
fn static_scene_yields_the_same_output() {
    let mut scene = Scene::new();
    cube_grid(&mut scene, 5, 3, -14.0);

    let mut harness = Harness::new(&scene, &config(16, toggles(false, true, false)));
    let camera = look_at(Point3::new(1.0, 0.5, 0.0), Point3::new(0.0, 0.0, -14.0), WIDTH as f32 / HEIGHT as f32);

    let (first_summary, first) = harness.frame(0, &camera);
    let first_commands: BTreeSet<(u32, u32)> = harness
        .meshlet_commands(first_summary.frame_slot)
        .iter()
        .map(|c| (c.first_instance, c.meshlet_index))
        .collect();

    let (second_summary, second) = harness.frame(1, &camera);
    let second_commands: BTreeSet<(u32, u32)> = harness
        .meshlet_commands(second_summary.frame_slot)
        .iter()
        .map(|c| (c.first_instance, c.meshlet_index))
        .collect();

    assert_ne!(first_summary.frame_slot, second_summary.frame_slot);
    assert!(!first_commands.is_empty());
    assert_eq!(first_commands, second_commands);
    assert_eq!(sorted_triangles(&first), sorted_triangles(&second));
}

/// Everything one frame produced that a static scene must reproduce
#[derive(Debug, PartialEq)]
struct FrameOutput {
    batches: [u32; 2],
    commands: BTreeSet<(u32, u32, u32)>,
    mesh_flags: Vec<u32>,
    normal_triangles: Vec<(u32, [u32; 3])>,
    recovered_triangles: Vec<(u32, [u32; 3])>,
}

#[test]
fn static_scene_settles_with_occlusion_and_reocclusion() {
    let mut scene = Scene::new();
    // Small wall hiding the middle of the cube grid
    let wall = scene.add_mesh(Mesh::grid(4, 1.0, 124));
    scene
        .add_object(wall, Matrix4::from_translation(Vector3::new(0.0, 0.0, -6.0)))
        .expect("wall mesh is live");
    cube_grid(&mut scene, 5, 3, -14.0);
    let object_count = scene.objects.len() as u64;

    let mut harness = Harness::new(&scene, &config(16, toggles(true, true, true)));
    let camera = front_camera();

    let mut outputs = Vec::new();
    let mut stats = Vec::new();
    for frame in 0..4 {
        let (summary, batches) = harness.frame(frame, &camera);
        let in_pass = |pass: CullPass| sorted_triangles(batches.iter().filter(|b| b.pass == pass));
        outputs.push(FrameOutput {
            batches: summary.batches,
            commands: harness
                .meshlet_commands(summary.frame_slot)
                .iter()
                .map(|c| (c.first_instance, c.meshlet_index, c.flags))
                .collect(),
            mesh_flags: harness.mesh_visibility(),
            normal_triangles: in_pass(CullPass::Normal),
            recovered_triangles: in_pass(CullPass::Reocclusion),
        });
        stats.push(harness.executor.stats().clone());
        assert_eq!(summary.pyramid_valid, frame > 0);
    }

    // The pyramid hides something, and the frame after it looks the same
    assert!(stats[2].meshes_visible[0] < object_count);
    assert!(!outputs[2].normal_triangles.is_empty());
    assert_eq!(outputs[2], outputs[3]);
    assert_eq!(stats[2], stats[3]);
}

#[test]
fn batching_neither_loses_nor_duplicates_triangles() {
    let mut scene = Scene::new();
    cube_grid(&mut scene, 7, 1, -12.0);
    let camera = front_camera();

    let mut outputs = Vec::new();
    for calls in [4u32, 5, 7, 64] {
        let mut harness = Harness::new(&scene, &config(calls, toggles(false, true, false)));
        let (summary, batches) = harness.frame(0, &camera);

        assert_eq!(summary.batches[0], 7u32.div_ceil(calls), "batches for {} calls", calls);
        assert!(batches.iter().all(|b| b.draws.len() <= calls as usize));

        let triangles = sorted_triangles(&batches);
        let unique: BTreeSet<_> = triangles.iter().copied().collect();
        assert_eq!(unique.len(), triangles.len(), "duplicated triangles with {} calls", calls);
        outputs.push(triangles);
    }

    let unbounded = outputs.last().expect("four runs");
    assert!(!unbounded.is_empty());
    for batched in &outputs {
        assert_eq!(batched, unbounded);
    }
}

#[test]
fn one_meshlet_past_the_batch_budget_gets_its_own_batch() {
    let mut scene = Scene::new();
    cube_grid(&mut scene, 9, 1, -15.0);

    let mut harness = Harness::new(&scene, &config(8, toggles(false, false, false)));
    let (summary, batches) = harness.frame(0, &front_camera());

    assert_eq!(summary.batches, [2, 0]);
    let sizes: Vec<usize> = batches.iter().map(|b| b.draws.len()).collect();
    assert_eq!(sizes, vec![8, 1]);
    assert_eq!(harness.visible_meshlet_count(summary.frame_slot), 9);
}

#[test]
fn command_overflow_is_reported() {
    let mut scene = Scene::new();
    cube_grid(&mut scene, 9, 2, -15.0);

    // 18 visible meshlets, room for 16 commands
    let mut harness = Harness::new(&scene, &config(8, toggles(false, false, false)));
    let camera = front_camera();
    let (list, _) = harness.record(0, &camera);
    let result = harness.submit(&list, &camera);
    assert!(matches!(
        result,
        Err(CullError::CapacityExceeded { requested: 18, capacity: 16, .. })
    ));
}

#[test]
fn reocclusion_recovers_objects_hidden_by_a_stale_pyramid() {
    let mut scene = Scene::new();
    // Wall covering the middle of the first camera's view. Its bounding
    // sphere stays clear of the camera, so the turned frustum rejects it.
    let wall = scene.add_mesh(Mesh::grid(4, 2.0, 124));
    scene
        .add_object(wall, Matrix4::from_translation(Vector3::new(0.0, 0.0, -5.0)))
        .expect("wall mesh is live");
    // Behind the first camera, in front of the second
    let cube = scene.add_mesh(Mesh::cube(0.5));
    for x in [-2.0, 0.0, 2.0] {
        scene
            .add_object(cube, Matrix4::from_translation(Vector3::new(x, 0.0, 20.0)))
            .expect("cube mesh is live");
    }
    let object_count = scene.objects.len() as u64;

    let mut harness = Harness::new(&scene, &config(16, toggles(true, true, true)));

    let (summary, _) = harness.frame(0, &front_camera());
    assert!(summary.reocclusion);
    assert!(!summary.pyramid_valid);
    let stats = harness.executor.stats().clone();
    assert_eq!(stats.meshes_visible[0], 1);
    assert_eq!(stats.mesh_tests[1], object_count - stats.meshes_visible[0]);

    // Turn around: the pyramid still holds the wall
    let turned = look_at(Point3::new(0.0, 0.0, 0.0), Point3::new(0.0, 0.0, 1.0), WIDTH as f32 / HEIGHT as f32);
    let (summary, batches) = harness.frame(1, &turned);
    assert!(summary.pyramid_valid);

    let stats = harness.executor.stats().clone();
    assert_eq!(stats.mesh_tests[0], object_count);
    assert_eq!(stats.meshes_visible[0], 0);
    assert_eq!(stats.mesh_tests[1], object_count - stats.meshes_visible[0]);
    assert_eq!(stats.meshes_visible[1], 3);

    let mesh_flags = harness.mesh_visibility();
    assert_eq!(mesh_flags[0], 0);
    for object in 1..=3 {
        assert_eq!(mesh_flags[object], flags::MESH_VISIBLE | flags::MESH_RECOVERED);
    }

    assert!(batches
        .iter()
        .filter(|b| b.pass == CullPass::Normal)
        .all(|b| b.draws.is_empty()));
    let recovered: BTreeSet<u32> = batches
        .iter()
        .filter(|b| b.pass == CullPass::Reocclusion)
        .flat_map(|b| b.draws.iter().map(|d| d.first_instance))
        .collect();
    assert_eq!(recovered, BTreeSet::from([1, 2, 3]));
}

#[test]
fn ring_slots_are_consumed_before_reuse() {
    let mut scene = Scene::new();
    cube_grid(&mut scene, 7, 1, -12.0);
    let cameras = [
        front_camera(),
        look_at(Point3::new(0.5, 0.0, 0.0), Point3::new(0.0, 0.0, -12.0), WIDTH as f32 / HEIGHT as f32),
        look_at(Point3::new(-0.5, 0.3, 0.0), Point3::new(0.0, 0.0, -12.0), WIDTH as f32 / HEIGHT as f32),
    ];

    let mut reference_output: Option<Vec<Vec<(u32, [u32; 3])>>> = None;
    for depth in [1u32, 2, 4, 8] {
        let mut config = config(4, toggles(true, true, true));
        config.limits.batch_overlap = depth;
        let mut harness = Harness::new(&scene, &config);

        let mut per_frame = Vec::new();
        for (frame, camera) in cameras.iter().enumerate() {
            let (list, summary) = harness.record(frame as u64, camera);
            assert_eq!(summary.batches, [2, 2]);

            let mut occupied = vec![false; depth as usize];
            let mut consumed_slots = Vec::new();
            for op in list.ops() {
                match op {
                    CullOp::Dispatch(dispatch) => {
                        let slot = dispatch.params.ring_slot as usize;
                        match dispatch.kernel {
                            Kernel::BatchClear => {
                                assert!(!occupied[slot], "slot {} reused before its consumer (depth {})", slot, depth);
                                occupied[slot] = true;
                            }
                            Kernel::TriangleCull(_) | Kernel::BatchCountClear | Kernel::BatchCompact => {
                                assert!(occupied[slot]);
                            }
                            _ => {}
                        }
                    }
                    CullOp::Consume(consume) => {
                        let slot = consume.ring_slot as usize;
                        assert!(occupied[slot]);
                        occupied[slot] = false;
                        consumed_slots.push(consume.ring_slot);
                    }
                    _ => {}
                }
            }
            let expected: Vec<u32> = (0..4).map(|k| k % depth).collect();
            assert_eq!(consumed_slots, expected);
            assert!((0..depth).all(|slot| !harness.pipeline.batch_cull().ring().is_in_flight(slot)));

            let batches = harness.submit(&list, camera).expect("frame executes");
            assert!(batches.iter().zip(&expected).all(|(b, slot)| b.ring_slot == *slot));
            per_frame.push(sorted_triangles(&batches));
        }

        match &reference_output {
            None => reference_output = Some(per_frame),
            Some(reference) => assert_eq!(&per_frame, reference, "output differs at depth {}", depth),
        }
    }
}

fn without_barrier_after(list: &CommandList, kernel: Kernel) -> Vec<CullOp> {
    let ops = list.ops();
    let dispatch = ops
        .iter()
        .position(|op| matches!(op, CullOp::Dispatch(d) if d.kernel == kernel))
        .expect("kernel recorded");
    let barrier = ops[dispatch..]
        .iter()
        .position(|op| matches!(op, CullOp::Barrier(_)))
        .map(|offset| dispatch + offset)
        .expect("barrier follows the kernel");

    let mut ops = ops.to_vec();
    ops.remove(barrier);
    ops
}

#[test]
fn recorded_frames_keep_barrier_discipline() {
    let mut scene = Scene::new();
    cube_grid(&mut scene, 7, 1, -12.0);
    let mut harness = Harness::new(&scene, &config(4, toggles(true, true, true)));
    let camera = front_camera();

    let (list, _) = harness.record(0, &camera);
    HazardTracker::new()
        .validate(&harness.ctx.resources, list.ops())
        .expect("recorded frame validates");

    for kernel in [
        Kernel::MeshCull(CullPass::Normal),
        Kernel::MeshletCounterClear,
        Kernel::PrepareBatchDispatch,
        Kernel::BatchClear,
        Kernel::TriangleCull(CullPass::Normal),
        Kernel::BatchCompact,
        Kernel::DepthReduceSource,
    ] {
        let ops = without_barrier_after(&list, kernel);
        let result = HazardTracker::new().validate(&harness.ctx.resources, &ops);
        assert!(
            matches!(result, Err(CullError::Hazard { .. })),
            "missing barrier after {:?} went unnoticed",
            kernel
        );
    }

    // Later frames validate inside the executor across submissions
    harness.submit(&list, &camera).expect("frame 0 executes");
    for frame in 1..3 {
        harness.frame(frame, &camera);
    }
}

#[test]
fn pyramid_holds_the_farthest_depth_of_each_footprint() {
    let mut scene = Scene::new();
    cube_grid(&mut scene, 4, 2, -8.0);
    cube_grid(&mut scene, 6, 3, -16.0);

    // Odd-sized target so footprints overlap
    let (width, height) = (90, 45);
    let mut harness = Harness::with_target(&scene, &config(32, toggles(true, true, false)), width, height);
    let camera = init_camera(width, height);
    harness.frame(0, &camera);

    let pyramid = harness.pipeline.pyramid();
    let (pyramid_width, pyramid_height, levels) = pyramid_dimensions(width, height, 4096);
    assert_eq!(pyramid.size(), (pyramid_width, pyramid_height));
    assert_eq!(pyramid.mip_levels(), levels);
    assert!(pyramid_width <= width && pyramid_height <= height);

    let storage = harness.storage();
    let depth = storage.mip(harness.depth, 0).expect("depth target written");
    assert!(depth.iter().any(|&d| d > 0.0), "nothing was rasterized");

    let mut source: Vec<f32> = depth.to_vec();
    let (mut source_width, mut source_height) = (width, height);
    for level in 0..levels {
        let (mip_width, mip_height) = ((pyramid_width >> level).max(1), (pyramid_height >> level).max(1));
        let mip = storage.mip(pyramid.texture(), level).expect("pyramid mip written");
        assert_eq!(mip.len(), (mip_width * mip_height) as usize);

        for y in 0..mip_height {
            let (y0, y1) = reduce_footprint(y, source_height, mip_height);
            for x in 0..mip_width {
                let (x0, x1) = reduce_footprint(x, source_width, mip_width);
                let mut expected = f32::MAX;
                for sy in y0..y1 {
                    for sx in x0..x1 {
                        expected = expected.min(source[(sy * source_width + sx) as usize]);
                    }
                }
                assert_eq!(mip[(y * mip_width + x) as usize], expected, "level {} texel ({}, {})", level, x, y);
            }
        }

        source = mip.to_vec();
        source_width = mip_width;
        source_height = mip_height;
    }
}

#[test]
fn resized_depth_target_restarts_the_pyramid() {
    let mut scene = Scene::new();
    cube_grid(&mut scene, 4, 2, -8.0);
    let mut harness = Harness::new(&scene, &config(16, toggles(true, true, true)));

    let camera = front_camera();
    harness.frame(0, &camera);
    let (summary, _) = harness.frame(1, &camera);
    assert!(summary.pyramid_valid);
    assert!(!harness.pipeline.resize(&mut harness.ctx).expect("depth target is live"));

    // The renderer resizes its depth target, then the pipeline follows
    let (width, height) = (130, 70);
    harness
        .ctx
        .resources
        .resize_texture(harness.depth, width, height)
        .expect("depth target is live");
    assert!(harness.pipeline.resize(&mut harness.ctx).expect("depth target is live"));
    let (pyramid_width, pyramid_height, levels) = pyramid_dimensions(width, height, 4096);
    assert_eq!(harness.pipeline.pyramid().size(), (pyramid_width, pyramid_height));
    assert_eq!(harness.pipeline.pyramid().mip_levels(), levels);

    let camera = init_camera(width, height);
    let (summary, batches) = harness.frame(2, &camera);
    assert!(!summary.pyramid_valid);
    assert!(batches.iter().any(|b| !b.draws.is_empty()));
    let (summary, _) = harness.frame(3, &camera);
    assert!(summary.pyramid_valid);

    let storage = harness.storage();
    let depth = storage.mip(harness.depth, 0).expect("depth target written");
    assert_eq!(depth.len(), (width * height) as usize);
    let top = storage
        .mip(harness.pipeline.pyramid().texture(), 0)
        .expect("pyramid mip written");
    assert_eq!(top.len(), (pyramid_width * pyramid_height) as usize);
    assert!(top.iter().any(|&d| d > 0.0));
}
