// ABOUTME: Deterministic assembly of the sandboxed script: base boilerplate,
// ABOUTME: mode boilerplate with its base import inlined away, marker, user code

use crate::types::RenderMode;

const BASE_TEMPLATE: &str = include_str!("../templates/base.py");
const SCREENSHOT_TEMPLATE: &str = include_str!("../templates/screenshot.py");
const VIDEO_TEMPLATE: &str = include_str!("../templates/video.py");

/// Printed between the boilerplate and the user snippet so log readers can
/// tell framework noise from user output.
pub const STARTUP_MARKER: &str = r#"print("Starting user code...")"#;

/// The import line mode templates use when run standalone; the assembler
/// inlines the base template instead, so the line must not survive.
const BASE_IMPORT_PREFIX: &str = "from templates.base import";

/// Pure composition of the final `main.py`. Templates are embedded at
/// compile time, so lookups never touch the filesystem.
pub struct ScriptAssembler;

impl ScriptAssembler {
    /// Base boilerplate, then the mode template (base import stripped),
    /// then the startup marker, then the user snippet, in that order,
    /// separated by blank lines.
    pub fn compose(mode: RenderMode, user_code: &str) -> String {
        let mode_template = Self::template_for(mode);
        let inlined = strip_base_import(mode_template);
        format!(
            "{}\n\n{}\n\n{}\n\n{}\n",
            BASE_TEMPLATE.trim_end(),
            inlined.trim_end(),
            STARTUP_MARKER,
            user_code.trim_end(),
        )
    }

    fn template_for(mode: RenderMode) -> &'static str {
        match mode {
            RenderMode::Screenshot => SCREENSHOT_TEMPLATE,
            RenderMode::Video => VIDEO_TEMPLATE,
        }
    }
}

fn strip_base_import(template: &str) -> String {
    template
        .lines()
        .filter(|line| !line.trim_start().starts_with(BASE_IMPORT_PREFIX))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const USER_CODE: &str = "from kivy.app import App\n\nclass Demo(App):\n    pass\n\nDemo().run()";

    #[test]
    fn test_compose_orders_sections() {
        let script = ScriptAssembler::compose(RenderMode::Screenshot, USER_CODE);
        let base_at = script.find("_install_background").unwrap();
        let mode_at = script.find("on_flip").unwrap();
        let marker_at = script.find(STARTUP_MARKER).unwrap();
        let user_at = script.find("class Demo").unwrap();
        assert!(base_at < mode_at);
        assert!(mode_at < marker_at);
        assert!(marker_at < user_at);
    }

    #[test]
    fn test_base_import_is_inlined_away() {
        for mode in [RenderMode::Screenshot, RenderMode::Video] {
            let script = ScriptAssembler::compose(mode, USER_CODE);
            assert!(
                !script.contains("from templates.base import"),
                "cross-import must be stripped for {mode}"
            );
            // The inlined definition replaces the import.
            assert!(script.contains("def _install_background"));
        }
    }

    #[test]
    fn test_video_mode_targets_the_video_artifact() {
        let script = ScriptAssembler::compose(RenderMode::Video, USER_CODE);
        assert!(script.contains("/work/kivy_video.mp4"));
        assert!(!script.contains("/work/kivy_screenshot.png"));
    }

    #[test]
    fn test_screenshot_mode_targets_the_screenshot_artifact() {
        let script = ScriptAssembler::compose(RenderMode::Screenshot, USER_CODE);
        assert!(script.contains("/work/kivy_screenshot.png"));
    }

    #[test]
    fn test_composition_is_deterministic() {
        let a = ScriptAssembler::compose(RenderMode::Screenshot, USER_CODE);
        let b = ScriptAssembler::compose(RenderMode::Screenshot, USER_CODE);
        assert_eq!(a, b);
    }

    #[test]
    fn test_user_code_lands_verbatim_after_marker() {
        let script = ScriptAssembler::compose(RenderMode::Screenshot, "x = 1");
        let marker_end = script.find(STARTUP_MARKER).unwrap() + STARTUP_MARKER.len();
        assert_eq!(script[marker_end..].trim(), "x = 1");
    }
}
