#![allow(irrefutable_let_patterns)]

use ash::vk;
use glam::Vec3;
use std::{collections::HashSet, path::PathBuf, time};

use glint::{
    Camera, GeometryChunk, ImageData, MaterialDesc, Renderer, RendererDesc, Scene, ShaderPaths,
    Vertex,
};

const WINDOW_SIZE: vk::Extent2D = vk::Extent2D {
    width: 1600,
    height: 1200,
};
const MOVE_SPEED: f32 = 4.0;
const TURN_SPEED: f32 = 1.5;

fn quad(corners: [Vec3; 4], normal: Vec3, uv_scale: f32, material_index: u32) -> GeometryChunk {
    let uvs = [[0.0, 0.0], [uv_scale, 0.0], [uv_scale, uv_scale], [0.0, uv_scale]];
    GeometryChunk {
        vertices: corners
            .iter()
            .zip(uvs)
            .map(|(&position, uv)| Vertex {
                position: position.into(),
                uv,
                normal: normal.into(),
            })
            .collect(),
        indices: vec![0, 1, 2, 2, 3, 0],
        material_index,
    }
}

fn cube(center: Vec3, half: f32, material_index: u32) -> Vec<GeometryChunk> {
    let faces: [(Vec3, Vec3, Vec3); 6] = [
        (Vec3::X, Vec3::Y, Vec3::Z),
        (Vec3::NEG_X, Vec3::Y, Vec3::NEG_Z),
        (Vec3::Y, Vec3::Z, Vec3::X),
        (Vec3::NEG_Y, Vec3::Z, Vec3::NEG_X),
        (Vec3::Z, Vec3::Y, Vec3::NEG_X),
        (Vec3::NEG_Z, Vec3::Y, Vec3::X),
    ];
    faces
        .iter()
        .map(|&(normal, up, right)| {
            let base = center + normal * half;
            quad(
                [
                    base - right * half - up * half,
                    base + right * half - up * half,
                    base + right * half + up * half,
                    base - right * half + up * half,
                ],
                normal,
                1.0,
                material_index,
            )
        })
        .collect()
}

fn checkerboard(size: u32, cell: u32, bright: [u8; 4], dark: [u8; 4]) -> ImageData {
    let mut rgba8 = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let color = if ((x / cell) + (y / cell)) % 2 == 0 {
                bright
            } else {
                dark
            };
            rgba8.extend_from_slice(&color);
        }
    }
    ImageData {
        width: size,
        height: size,
        rgba8,
    }
}

fn demo_scene() -> Scene {
    let mut chunks = vec![quad(
        [
            Vec3::new(-400.0, 0.0, -400.0),
            Vec3::new(400.0, 0.0, -400.0),
            Vec3::new(400.0, 0.0, 400.0),
            Vec3::new(-400.0, 0.0, 400.0),
        ],
        Vec3::Y,
        64.0,
        0,
    )];
    chunks.extend(cube(Vec3::new(-150.0, 100.0, -250.0), 100.0, 1));
    chunks.extend(cube(Vec3::new(200.0, 60.0, -150.0), 60.0, 2));

    Scene {
        chunks,
        materials: vec![
            MaterialDesc {
                base_color_texture: 0,
                metallic_roughness_texture: -1,
                normal_texture: -1,
            },
            MaterialDesc {
                base_color_texture: 1,
                metallic_roughness_texture: -1,
                normal_texture: -1,
            },
            MaterialDesc {
                base_color_texture: -1,
                metallic_roughness_texture: -1,
                normal_texture: -1,
            },
        ],
        images: vec![
            checkerboard(512, 64, [220, 220, 220, 255], [40, 40, 40, 255]),
            checkerboard(256, 32, [200, 120, 60, 255], [90, 40, 20, 255]),
        ],
    }
}

fn shader_paths() -> ShaderPaths {
    let dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("shaders"));
    ShaderPaths {
        closest_hit: dir.join("primary.rchit.spv"),
        ray_gen: dir.join("primary.rgen.spv"),
        miss: dir.join("primary.rmiss.spv"),
        shadow_miss: dir.join("shadow.rmiss.spv"),
    }
}

fn update_camera(camera: &mut Camera, pressed: &HashSet<winit::event::VirtualKeyCode>, dt: f32) {
    use winit::event::VirtualKeyCode as Key;
    let mut motion = Vec3::ZERO;
    if pressed.contains(&Key::W) {
        motion += camera.forward();
    }
    if pressed.contains(&Key::S) {
        motion -= camera.forward();
    }
    if pressed.contains(&Key::D) {
        motion += camera.right();
    }
    if pressed.contains(&Key::A) {
        motion -= camera.right();
    }
    if pressed.contains(&Key::E) {
        motion += Vec3::Y;
    }
    if pressed.contains(&Key::Q) {
        motion -= Vec3::Y;
    }
    camera.position += motion * (MOVE_SPEED * dt);

    let mut turn = (0.0, 0.0);
    if pressed.contains(&Key::Right) {
        turn.0 += TURN_SPEED * dt;
    }
    if pressed.contains(&Key::Left) {
        turn.0 -= TURN_SPEED * dt;
    }
    if pressed.contains(&Key::Up) {
        turn.1 += TURN_SPEED * dt;
    }
    if pressed.contains(&Key::Down) {
        turn.1 -= TURN_SPEED * dt;
    }
    camera.rotate(turn.0, turn.1);
}

fn main() {
    env_logger::init();

    let event_loop = winit::event_loop::EventLoop::new();
    let window = winit::window::WindowBuilder::new()
        .with_title("glint-viewer")
        .with_inner_size(winit::dpi::PhysicalSize::new(
            WINDOW_SIZE.width,
            WINDOW_SIZE.height,
        ))
        .with_resizable(false)
        .build(&event_loop)
        .unwrap();

    let scene = demo_scene();
    let mut renderer = Some(
        Renderer::new(
            &window,
            WINDOW_SIZE,
            &scene,
            &shader_paths(),
            RendererDesc {
                validation: cfg!(debug_assertions),
                overlay: false,
                // The demo scene is authored in centimeters.
                scene_transform: glam::Mat4::from_scale(Vec3::splat(0.01)),
            },
        )
        .unwrap(),
    );

    let mut camera = Camera::new(
        Vec3::new(0.0, 1.5, 4.0),
        WINDOW_SIZE.width as f32 / WINDOW_SIZE.height as f32,
    );
    let mut pressed = HashSet::new();
    let mut last_update = time::Instant::now();

    event_loop.run(move |event, _, control_flow| {
        *control_flow = winit::event_loop::ControlFlow::Poll;
        match event {
            winit::event::Event::RedrawEventsCleared => {
                window.request_redraw();
            }
            winit::event::Event::WindowEvent { event, .. } => match event {
                winit::event::WindowEvent::KeyboardInput {
                    input:
                        winit::event::KeyboardInput {
                            virtual_keycode: Some(key_code),
                            state,
                            ..
                        },
                    ..
                } => match state {
                    winit::event::ElementState::Pressed => {
                        if key_code == winit::event::VirtualKeyCode::Escape {
                            *control_flow = winit::event_loop::ControlFlow::Exit;
                        }
                        pressed.insert(key_code);
                    }
                    winit::event::ElementState::Released => {
                        pressed.remove(&key_code);
                    }
                },
                winit::event::WindowEvent::CloseRequested => {
                    *control_flow = winit::event_loop::ControlFlow::Exit;
                }
                _ => {}
            },
            winit::event::Event::RedrawRequested(_) => {
                let now = time::Instant::now();
                let dt = (now - last_update).as_secs_f32();
                last_update = now;
                update_camera(&mut camera, &pressed, dt);
                renderer.as_mut().unwrap().render(&camera);
            }
            winit::event::Event::LoopDestroyed => {
                renderer.take().unwrap().destroy();
            }
            _ => {}
        }
    })
}
