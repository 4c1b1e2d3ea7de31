use crate::topology::Rect;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use x11rb::connection::Connection;
use x11rb::protocol::randr::{ConnectionExt as RandrExt, NotifyMask};
use x11rb::protocol::Event;
use x11rb::xcb_ffi::XCBConnection;

/// Query active RandR CRTCs as `(output name, bounds)`.
pub fn detect_monitors() -> anyhow::Result<Vec<(String, Rect)>> {
    // Connect using XCB (requires libxcb at runtime)
    let (conn, screen_num) = XCBConnection::connect(None)?;
    let root = conn.setup().roots[screen_num].root;

    let screen_res = conn.randr_get_screen_resources_current(root)?.reply()?;
    let mut monitors = Vec::new();

    for &crtc in &screen_res.crtcs {
        let crtc_info = conn
            .randr_get_crtc_info(crtc, screen_res.config_timestamp)?
            .reply()?;

        if crtc_info.mode == 0 {
            continue; // Inactive CRTC
        }

        let mut name = format!("X11-{}", crtc);
        if let Some(&output) = crtc_info.outputs.first() {
            let output_info = conn
                .randr_get_output_info(output, screen_res.config_timestamp)?
                .reply()?;
            name = String::from_utf8_lossy(&output_info.name).to_string();
        }

        monitors.push((
            name,
            Rect::new(
                crtc_info.x as i32,
                crtc_info.y as i32,
                crtc_info.width as u32,
                crtc_info.height as u32,
            ),
        ));
    }

    // Fallback if no RandR monitors found
    if monitors.is_empty() {
        let screen = &conn.setup().roots[screen_num];
        monitors.push((
            "X11-0".to_string(),
            Rect::new(
                0,
                0,
                screen.width_in_pixels as u32,
                screen.height_in_pixels as u32,
            ),
        ));
    }

    // Sort left to right, top to bottom so screen indices are stable
    monitors.sort_by_key(|(_, r)| (r.x, r.y));
    debug!("[SCREENS] RandR monitors: {:?}", monitors);
    Ok(monitors)
}

/// Watch RandR for output/CRTC changes and notify `tx` on each one.
///
/// Runs on a dedicated thread because `wait_for_event` blocks.
pub fn spawn_change_watcher(tx: mpsc::UnboundedSender<()>) {
    std::thread::spawn(move || {
        let (conn, screen_num) = match XCBConnection::connect(None) {
            Ok(c) => c,
            Err(e) => {
                warn!("[SCREENS] Cannot watch display changes: {}", e);
                return;
            }
        };
        let root = conn.setup().roots[screen_num].root;
        if let Err(e) = conn.randr_select_input(
            root,
            NotifyMask::SCREEN_CHANGE | NotifyMask::OUTPUT_CHANGE | NotifyMask::CRTC_CHANGE,
        ) {
            warn!("[SCREENS] RandR select input failed: {}", e);
            return;
        }
        let _ = conn.flush();
        info!("[SCREENS] Watching RandR for display changes");

        loop {
            match conn.wait_for_event() {
                Ok(Event::RandrScreenChangeNotify(_)) | Ok(Event::RandrNotify(_)) => {
                    if tx.send(()).is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("[SCREENS] X11 connection lost: {}", e);
                    break;
                }
            }
        }
    });
}
