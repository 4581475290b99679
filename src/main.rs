mod app;

use std::ffi::OsString;
use std::path::Path;
use color_eyre::Result;
use app::App;

/// `PRISM_HEADLESS=1` renders a single frame on the CPU instead of opening a window.
fn headless_requested(value: Option<OsString>) -> bool {
    value.is_some_and(|v| v == "1")
}

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    if headless_requested(std::env::var_os("PRISM_HEADLESS")) {
        return app::render_snapshot(Path::new("snapshot.png"), 256, 256);
    }

    App::new().run()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_one_enables_headless() {
        assert!(headless_requested(Some("1".into())));
        assert!(!headless_requested(Some("0".into())));
        assert!(!headless_requested(Some("".into())));
        assert!(!headless_requested(None));
    }
}
