// Ember demo - clear, draw a triangle, present
//
// Drives the frame orchestrator from a winit event loop: acquire an image,
// record a command buffer bracketed by render-pass begin/end, submit with
// semaphore/fence wiring, present. Escape quits, F11 toggles fullscreen.

use anyhow::{Context, Result};
use ember::backend::pipeline::Vertex;
use ember::config::Config;
use ember::renderer::{Mesh, Renderer, RendererOptions};
use ember::DeviceContext;
use glam::Mat4;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

const TRIANGLE_VERTICES: [Vertex; 3] = [
    Vertex {
        position: [0.0, -0.5, 0.0],
        color: [1.0, 0.2, 0.2],
    },
    Vertex {
        position: [-0.5, 0.5, 0.0],
        color: [0.2, 1.0, 0.2],
    },
    Vertex {
        position: [0.5, 0.5, 0.0],
        color: [0.2, 0.2, 1.0],
    },
];

const TRIANGLE_INDICES: [u32; 3] = [0, 1, 2];

fn main() -> Result<()> {
    let config = Config::load();

    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    log::info!("Starting ember");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen {
            "fullscreen"
        } else {
            "windowed"
        }
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Application state. Field order matters for drop: the renderer waits for
/// the device to go idle before the mesh buffers are freed.
struct App {
    config: Config,
    renderer: Option<Renderer>,
    mesh: Option<Mesh>,
    window: Option<Arc<Window>>,
    is_fullscreen: bool,

    // FPS tracking
    frame_count: u32,
    last_fps_update: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        Self {
            config,
            renderer: None,
            mesh: None,
            window: None,
            is_fullscreen,
            frame_count: 0,
            last_fps_update: Instant::now(),
        }
    }

    fn init_renderer(&mut self, window: Arc<Window>) -> Result<()> {
        let enable_validation = cfg!(debug_assertions) && self.config.debug.validation_layers;

        let display_handle = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();
        let window_handle = window
            .window_handle()
            .context("Failed to get window handle")?
            .as_raw();

        let device = DeviceContext::new(
            display_handle,
            window_handle,
            &self.config.window.title,
            enable_validation,
        )?;

        let size = window.inner_size();
        let options = RendererOptions::from_config(&self.config, size.width, size.height);
        let mut renderer = Renderer::new(device, &options)?;

        let mesh = renderer.upload_mesh(&TRIANGLE_VERTICES, &TRIANGLE_INDICES)?;

        self.renderer = Some(renderer);
        self.mesh = Some(mesh);
        Ok(())
    }

    fn render_frame(&mut self) -> Result<()> {
        let (Some(renderer), Some(mesh)) = (self.renderer.as_mut(), self.mesh.as_ref()) else {
            return Ok(());
        };

        renderer.begin_frame()?;
        renderer.update_uniforms(Mat4::IDENTITY)?;
        renderer.draw_mesh(mesh, Mat4::IDENTITY)?;
        renderer.end_frame()?;

        Ok(())
    }

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;
            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
            } else {
                window.set_fullscreen(None);
            }
        }
    }

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        self.frame_count += 1;
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();

        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;
            if let Some(ref window) = self.window {
                window.set_title(&format!("{} - {:.0} FPS", self.config.window.title, fps));
            }
            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes =
                window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_renderer(window.clone()) {
            log::error!("Failed to initialize renderer: {:?}", e);
            event_loop.exit();
            return;
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                if let Some(ref renderer) = self.renderer {
                    let _ = renderer.wait_idle();
                }
                event_loop.exit();
            }

            WindowEvent::RedrawRequested => {
                if let Err(e) = self.render_frame() {
                    // Per-frame failures are fatal in this design
                    log::error!("Render error: {:?}", e);
                    if let Some(ref renderer) = self.renderer {
                        let _ = renderer.wait_idle();
                    }
                    event_loop.exit();
                    return;
                }
                self.update_fps();
            }

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                if let Some(ref renderer) = self.renderer {
                                    let _ = renderer.wait_idle();
                                }
                                event_loop.exit();
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}
