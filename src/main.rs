use winit::{
    event::{ElementState, Event, KeyboardInput, VirtualKeyCode, WindowEvent},
    event_loop::EventLoop,
    window::WindowBuilder,
};

use pathtracer_gpu::input::{CameraController, InputState};
use pathtracer_gpu::scene::EnvironmentMap;
use pathtracer_gpu::{FrameError, LinearOracle, PathTracer, SceneState};

fn main() -> anyhow::Result<()> {
    env_logger::init();
    pollster::block_on(run())
}

async fn run() -> anyhow::Result<()> {
    let event_loop = EventLoop::new();
    let window = WindowBuilder::new()
        .with_title("Oracle Path Tracer")
        .build(&event_loop)?;

    let mut args = std::env::args().skip(1);
    let mut scene = match args.next() {
        Some(path) => SceneState::load_from_gltf_or_default(path),
        None => SceneState::new(),
    };
    if let Some(env_path) = args.next() {
        match EnvironmentMap::load(&env_path) {
            Ok(map) => scene.environment = Some(map),
            Err(error) => log::warn!("failed to load environment map {env_path}: {error}"),
        }
    }

    let mut tracer = PathTracer::new(&window, scene, Box::new(LinearOracle::new())).await?;
    let mut input = InputState::new();

    event_loop.run(move |event, _, control_flow| match event {
        Event::WindowEvent {
            ref event,
            window_id,
        } if window_id == window.id() => match event {
            WindowEvent::CloseRequested => control_flow.set_exit(),
            WindowEvent::Resized(physical_size) => {
                if let Err(error) = tracer.resize(*physical_size) {
                    log::error!("resize failed: {error}");
                }
            }
            WindowEvent::ScaleFactorChanged { new_inner_size, .. } => {
                if let Err(error) = tracer.resize(**new_inner_size) {
                    log::error!("resize failed: {error}");
                }
            }
            WindowEvent::KeyboardInput {
                input:
                    KeyboardInput {
                        state,
                        virtual_keycode: Some(key),
                        ..
                    },
                ..
            } => {
                let pressed = *state == ElementState::Pressed;
                match key {
                    VirtualKeyCode::W | VirtualKeyCode::A | VirtualKeyCode::S
                    | VirtualKeyCode::D => {
                        if pressed {
                            let (forward, right) = match key {
                                VirtualKeyCode::W => (1.0, 0.0),
                                VirtualKeyCode::S => (-1.0, 0.0),
                                VirtualKeyCode::A => (0.0, -1.0),
                                _ => (0.0, 1.0),
                            };
                            CameraController::translate(&mut tracer.camera, forward, right);
                            tracer.notify_camera_moved();
                        }
                        tracer.set_interacting(pressed);
                    }
                    VirtualKeyCode::P if pressed => tracer.toggle_accumulation(),
                    VirtualKeyCode::V if pressed => tracer.cycle_view_mode(),
                    VirtualKeyCode::Escape if pressed => control_flow.set_exit(),
                    _ => {}
                }
            }
            WindowEvent::MouseInput { button, state, .. } => {
                input.handle_mouse_input(*button, *state);
                if !input.mouse_pressed() {
                    tracer.set_interacting(false);
                }
            }
            WindowEvent::CursorMoved { position, .. } => {
                if let Some((delta_x, delta_y)) = input.handle_cursor_moved(*position) {
                    CameraController::rotate(&mut tracer.camera, delta_x, delta_y);
                    tracer.notify_camera_moved();
                    tracer.set_interacting(true);
                }
            }
            _ => {}
        },
        Event::RedrawRequested(window_id) if window_id == window.id() => {
            match tracer.render_tick() {
                Ok(()) => {}
                Err(FrameError::Surface(wgpu::SurfaceError::Lost)) => {
                    let size = tracer.renderer.size;
                    if let Err(error) = tracer.resize(size) {
                        log::error!("surface recovery failed: {error}");
                    }
                }
                Err(FrameError::Surface(wgpu::SurfaceError::OutOfMemory)) => {
                    log::error!("out of GPU memory, exiting");
                    control_flow.set_exit();
                }
                // Frame-fatal but recoverable: the next tick retries.
                Err(error) => log::error!("frame abandoned: {error}"),
            }
        }
        Event::MainEventsCleared => {
            window.request_redraw();
        }
        _ => {}
    })
}
