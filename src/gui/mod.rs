//! Preview windows.
//!
//! Windows are driven by an event loop that has to own the main thread, so applications hand their
//! actual `main` function to [`run`], which runs it on a second thread. Images are shown with
//! [`Window::show`](crate::pipeline::Preview::show); keys typed into any window are read back with
//! [`Window::poll_key`](crate::pipeline::Preview::poll_key).

mod renderer;

use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    process,
    rc::Rc,
    sync::Mutex,
    time::Duration,
};

use anyhow::bail;
use crossbeam_channel::{Receiver, Sender};
use once_cell::sync::{Lazy, OnceCell};
use winit::{
    event::{Event, WindowEvent},
    event_loop::{ControlFlow, EventLoop, EventLoopBuilder, EventLoopProxy, EventLoopWindowTarget},
    window::WindowId,
};

use crate::{
    image::{ChannelOrder, Image, Resolution},
    pipeline::{Key, Preview},
    termination::Termination,
};

use self::renderer::{Gpu, Renderer};

struct Gui {
    gpu: Rc<Gpu>,
    windows: HashMap<String, Renderer>,
    win_id_to_title: HashMap<WindowId, String>,
}

impl Gui {
    fn new() -> anyhow::Result<Self> {
        Ok(Self {
            gpu: Rc::new(pollster::block_on(Gpu::open())?),
            windows: HashMap::new(),
            win_id_to_title: HashMap::new(),
        })
    }

    fn show(
        &mut self,
        target: &EventLoopWindowTarget<Msg>,
        title: String,
        res: Resolution,
        data: Vec<u8>,
    ) {
        if !self.windows.contains_key(&title) {
            log::debug!("creating window '{title}' at {res}");
            let renderer = renderer::Window::open(target, &title, res)
                .and_then(|win| Renderer::new(win, self.gpu.clone()));
            match renderer {
                Ok(renderer) => {
                    self.win_id_to_title
                        .insert(renderer.window().id(), title.clone());
                    self.windows.insert(title.clone(), renderer);
                }
                Err(e) => {
                    log::error!("failed to open window '{title}': {e:#}");
                    return;
                }
            }
        }

        if let Some(renderer) = self.windows.get_mut(&title) {
            renderer.update_texture(res, &data);
            renderer.window().request_redraw();
        }
    }

    fn close(&mut self, title: &str) {
        if let Some(renderer) = self.windows.remove(title) {
            log::debug!("closing window '{title}'");
            self.win_id_to_title.remove(&renderer.window().id());
        }
    }

    fn run(mut self, event_loop: EventLoop<Msg>) -> ! {
        event_loop.run(move |event, target, flow| {
            *flow = ControlFlow::Wait;
            match event {
                Event::UserEvent(msg) => match msg {
                    Msg::Image { title, res, data } => self.show(target, title, res, data),
                    Msg::Close { title } => self.close(&title),
                    Msg::CloseAll => {
                        self.windows.clear();
                        self.win_id_to_title.clear();
                    }
                },
                Event::WindowEvent { window_id, event } => match event {
                    WindowEvent::ReceivedCharacter(c) => {
                        KEYS.0.send(Key::Char(c)).ok();
                    }
                    WindowEvent::CloseRequested => {
                        if let Some(title) = self.win_id_to_title.get(&window_id).cloned() {
                            self.close(&title);
                        }
                        KEYS.0.send(Key::Closed).ok();
                    }
                    _ => {}
                },
                Event::RedrawRequested(window_id) => {
                    let Some(title) = self.win_id_to_title.get(&window_id) else {
                        return;
                    };
                    if let Some(renderer) = self.windows.get_mut(title) {
                        if let Err(e) = renderer.redraw() {
                            log::error!("failed to redraw window '{title}': {e:#}");
                        }
                    }
                }
                _ => {}
            }
        });
    }
}

#[derive(Debug)]
enum Msg {
    Image {
        title: String,
        res: Resolution,
        data: Vec<u8>,
    },
    Close {
        title: String,
    },
    CloseAll,
}

static PROXY: OnceCell<Mutex<EventLoopProxy<Msg>>> = OnceCell::new();

/// Keys typed into any window, and window close requests.
static KEYS: Lazy<(Sender<Key>, Receiver<Key>)> = Lazy::new(crossbeam_channel::unbounded);

fn send(msg: Msg) -> anyhow::Result<()> {
    let Some(proxy) = PROXY.get() else {
        bail!("GUI is not running (the application has to be started with `handcam::run`)");
    };
    let proxy = proxy.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if proxy.send_event(msg).is_err() {
        bail!("GUI event loop has exited");
    }
    Ok(())
}

/// Runs `main` on a background thread while the GUI event loop takes over the main thread.
///
/// The process exits when `main` returns: with status 0 if it reports success, 1 if it returned an
/// error (which is printed), or 101 if it panicked.
pub fn run<F, R>(main: F) -> !
where
    F: FnOnce() -> R + Send + 'static,
    R: Termination + Send,
{
    let event_loop = EventLoopBuilder::with_user_event().build();
    if PROXY.set(Mutex::new(event_loop.create_proxy())).is_err() {
        eprintln!("`handcam::run` must only be called once");
        process::exit(1);
    }

    // Library is now initialized; spawn another thread to run the application code.
    std::thread::spawn(move || {
        let result = catch_unwind(AssertUnwindSafe(main));
        match result {
            Ok(r) => {
                if r.is_success() {
                    process::exit(0);
                } else {
                    r.report(); // may print the error message
                    process::exit(1);
                }
            }
            Err(_payload) => {
                // Panic handler has printed the panic message and backtrace already, exit with 101
                // to mimick libstd behavior.
                process::exit(101);
            }
        }
    });

    let gui = match Gui::new() {
        Ok(gui) => gui,
        Err(e) => {
            log::error!("failed to initialize graphics: {e:#}");
            process::exit(1);
        }
    };
    gui.run(event_loop);
}

/// Closes all preview windows.
pub fn destroy_all_windows() -> anyhow::Result<()> {
    send(Msg::CloseAll)
}

/// A preview window, identified by its title.
///
/// The window itself is created when the first image is shown.
#[derive(Debug, Clone)]
pub struct Window {
    title: String,
}

impl Window {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }
}

impl Preview for Window {
    fn show(&mut self, image: &Image) -> anyhow::Result<()> {
        // Image data is RGBA8 internally, so it can be uploaded to the GPU without conversion as
        // long as it is in RGB order.
        let data = if image.order() == ChannelOrder::Rgb {
            image.data().to_vec()
        } else {
            let mut image = image.clone();
            image.convert_order(ChannelOrder::Rgb);
            image.data().to_vec()
        };

        send(Msg::Image {
            title: self.title.clone(),
            res: image.resolution(),
            data,
        })
    }

    fn poll_key(&mut self, timeout: Duration) -> Option<Key> {
        KEYS.1.recv_timeout(timeout).ok()
    }

    fn close(&mut self) {
        send(Msg::Close {
            title: self.title.clone(),
        })
        .ok();
    }
}
