// ABOUTME: Static inspection of submitted text: snippet extraction, render classification,
// ABOUTME: display-size hints, and the ordered danger-pattern gate

use crate::settings::SecuritySettings;
use crate::types::HintSource;
use regex::Regex;

/// What a classification rule marks a snippet as containing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    Launch,
    Import,
}

struct ClassifyRule {
    pattern: &'static str,
    marker: Marker,
}

/// Matched case-insensitively against the snippet. A snippet classifies as
/// renderable only when at least one Launch and one Import rule both hit.
const CLASSIFY_RULES: &[ClassifyRule] = &[
    ClassifyRule { pattern: ".run()", marker: Marker::Launch },
    ClassifyRule { pattern: "runtouchapp(", marker: Marker::Launch },
    ClassifyRule { pattern: "async_runtouchapp", marker: Marker::Launch },
    ClassifyRule { pattern: "trio.run", marker: Marker::Launch },
    ClassifyRule { pattern: "import kivy", marker: Marker::Import },
    ClassifyRule { pattern: "from kivy", marker: Marker::Import },
    ClassifyRule { pattern: "import kivymd", marker: Marker::Import },
    ClassifyRule { pattern: "from kivymd", marker: Marker::Import },
    ClassifyRule { pattern: "import kivy_reloader", marker: Marker::Import },
    ClassifyRule { pattern: "from kivy_reloader", marker: Marker::Import },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Reject,
}

pub struct DangerRule {
    pub pattern: &'static str,
    pub verdict: Verdict,
}

/// Evaluated top to bottom against the raw snippet; the first matching rule
/// decides, so a narrow Allow entry can be placed ahead of a broader Reject.
/// No match means the snippet passes this layer.
pub const DANGER_RULES: &[DangerRule] = &[
    DangerRule { pattern: "import os", verdict: Verdict::Reject },
    DangerRule { pattern: "import subprocess", verdict: Verdict::Reject },
    DangerRule { pattern: "import sys", verdict: Verdict::Reject },
    DangerRule { pattern: "__import__", verdict: Verdict::Reject },
    DangerRule { pattern: "eval(", verdict: Verdict::Reject },
    DangerRule { pattern: "exec(", verdict: Verdict::Reject },
    DangerRule { pattern: "open(", verdict: Verdict::Reject },
    DangerRule { pattern: "file(", verdict: Verdict::Reject },
    DangerRule { pattern: "input(", verdict: Verdict::Reject },
    DangerRule { pattern: "raw_input(", verdict: Verdict::Reject },
];

/// Result of scanning a snippet for explicit display sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayHint {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub source: HintSource,
}

impl DisplayHint {
    pub fn none() -> Self {
        Self {
            width: None,
            height: None,
            source: HintSource::None,
        }
    }
}

/// Inspects submitted text before any sandbox is touched. Built once at
/// startup; all patterns compile in the constructor.
pub struct CodeInspector {
    fence: Regex,
    window_size: Regex,
    number: Regex,
    config_width: Regex,
    config_height: Regex,
    reject_dangerous: bool,
}

impl CodeInspector {
    pub fn new(security: &SecuritySettings) -> Self {
        Self {
            fence: Regex::new(r"(?si)```(?:python|py)[ \t]*\r?\n(.*?)```")
                .expect("static pattern"),
            window_size: Regex::new(r"Window\.size\s*=\s*[(\[]([^)\]]*)[)\]]")
                .expect("static pattern"),
            number: Regex::new(r"-?\d+(?:\.\d+)?").expect("static pattern"),
            config_width: Regex::new(
                r#"Config\.set\(\s*['"]graphics['"]\s*,\s*['"]width['"]\s*,\s*['"]?(\d+)['"]?\s*\)"#,
            )
            .expect("static pattern"),
            config_height: Regex::new(
                r#"Config\.set\(\s*['"]graphics['"]\s*,\s*['"]height['"]\s*,\s*['"]?(\d+)['"]?\s*\)"#,
            )
            .expect("static pattern"),
            reject_dangerous: security.reject_dangerous,
        }
    }

    /// Ordered fenced code blocks tagged as Python. Bodies are trimmed;
    /// text without any such fence yields an empty vec.
    pub fn extract_snippets(&self, text: &str) -> Vec<String> {
        self.fence
            .captures_iter(text)
            .map(|caps| caps[1].trim().to_string())
            .collect()
    }

    /// True only when the snippet contains both a recognized app-launch
    /// call and a framework import. Either alone is not a render target.
    pub fn classify(&self, snippet: &str) -> bool {
        let lowered = snippet.to_lowercase();
        let mut has_launch = false;
        let mut has_import = false;
        for rule in CLASSIFY_RULES {
            if lowered.contains(rule.pattern) {
                match rule.marker {
                    Marker::Launch => has_launch = true,
                    Marker::Import => has_import = true,
                }
            }
        }
        has_launch && has_import
    }

    /// First extracted snippet that classifies as renderable.
    pub fn select_renderable(&self, text: &str) -> Option<String> {
        self.extract_snippets(text)
            .into_iter()
            .find(|snippet| self.classify(snippet))
    }

    /// Returns the first rejecting pattern, or None when the snippet passes
    /// (or when rejection is disabled in settings).
    pub fn scan_danger(&self, snippet: &str) -> Option<&'static str> {
        if !self.reject_dangerous {
            return None;
        }
        for rule in DANGER_RULES {
            if snippet.contains(rule.pattern) {
                return match rule.verdict {
                    Verdict::Reject => Some(rule.pattern),
                    Verdict::Allow => None,
                };
            }
        }
        None
    }

    /// Parse an explicit display-size request out of the snippet.
    ///
    /// A window-size assignment wins over config statements. When several
    /// config statements set the same dimension, the last one wins, per
    /// dimension independently. Values that do not parse or are not
    /// positive are discarded; a window pair with an invalid member falls
    /// through to the config scan.
    pub fn parse_display_hint(&self, snippet: &str) -> DisplayHint {
        if let Some(caps) = self.window_size.captures(snippet) {
            let inner = &caps[1];
            let mut numbers = self
                .number
                .find_iter(inner)
                .filter_map(|m| m.as_str().parse::<f64>().ok());
            if let (Some(w), Some(h)) = (numbers.next(), numbers.next()) {
                if let (Some(width), Some(height)) = (positive_dimension(w), positive_dimension(h))
                {
                    return DisplayHint {
                        width: Some(width),
                        height: Some(height),
                        source: HintSource::Window,
                    };
                }
            }
        }

        let width = last_config_value(&self.config_width, snippet);
        let height = last_config_value(&self.config_height, snippet);
        if width.is_some() || height.is_some() {
            DisplayHint {
                width,
                height,
                source: HintSource::Config,
            }
        } else {
            DisplayHint::none()
        }
    }
}

/// Fractional sizes truncate; zero, negative, and out-of-range values are
/// unusable.
fn positive_dimension(value: f64) -> Option<u32> {
    if value >= 1.0 && value <= u32::MAX as f64 {
        Some(value as u32)
    } else {
        None
    }
}

fn last_config_value(pattern: &Regex, snippet: &str) -> Option<u32> {
    pattern
        .captures_iter(snippet)
        .last()
        .and_then(|caps| caps[1].parse::<u32>().ok())
        .filter(|value| *value > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SecuritySettings;

    fn inspector() -> CodeInspector {
        CodeInspector::new(&SecuritySettings::default())
    }

    fn lenient_inspector() -> CodeInspector {
        CodeInspector::new(&SecuritySettings {
            reject_dangerous: false,
            ..SecuritySettings::default()
        })
    }

    #[test]
    fn test_extracts_python_fences_in_order() {
        let text = "intro\n```python\nfirst = 1\n```\nmiddle\n```PY\nsecond = 2\n```\n```rust\nfn ignored() {}\n```";
        let snippets = inspector().extract_snippets(text);
        assert_eq!(snippets, vec!["first = 1".to_string(), "second = 2".to_string()]);
    }

    #[test]
    fn test_no_fence_yields_empty_sequence() {
        assert!(inspector().extract_snippets("").is_empty());
        assert!(inspector().extract_snippets("just prose, no code").is_empty());
    }

    #[test]
    fn test_classify_needs_both_launch_and_import() {
        let ins = inspector();
        let both = "from kivy.app import App\nclass A(App): pass\nA().run()";
        let launch_only = "class A:\n    pass\nA().run()";
        let import_only = "import kivy\nprint(kivy.__version__)";
        assert!(ins.classify(both));
        assert!(!ins.classify(launch_only));
        assert!(!ins.classify(import_only));
    }

    #[test]
    fn test_classify_recognizes_alternate_launchers() {
        let ins = inspector();
        assert!(ins.classify("from kivy.base import runTouchApp\nrunTouchApp(w)"));
        assert!(ins.classify("import kivymd\ntrio.run(main)"));
        assert!(!ins.classify("import numpy\nnumpy.run()"));
    }

    #[test]
    fn test_select_renderable_skips_non_target_blocks() {
        let text = "```python\nprint('helper')\n```\n```python\nfrom kivy.app import App\nApp().run()\n```";
        let chosen = inspector().select_renderable(text);
        assert!(chosen.unwrap().contains("App().run()"));
    }

    #[test]
    fn test_window_assignment_parses_both_forms() {
        let ins = inspector();
        let tuple = ins.parse_display_hint("Window.size = (400, 300)");
        assert_eq!(tuple, DisplayHint { width: Some(400), height: Some(300), source: HintSource::Window });

        let list = ins.parse_display_hint("Window.size=[1024, 768]");
        assert_eq!(list.width, Some(1024));
        assert_eq!(list.source, HintSource::Window);
    }

    #[test]
    fn test_fractional_window_values_truncate() {
        let hint = inspector().parse_display_hint("Window.size = (640.9, 480.2)");
        assert_eq!(hint.width, Some(640));
        assert_eq!(hint.height, Some(480));
    }

    #[test]
    fn test_window_wins_over_config() {
        let code = "Config.set('graphics', 'width', '1000')\nWindow.size = (400, 300)";
        let hint = inspector().parse_display_hint(code);
        assert_eq!(hint, DisplayHint { width: Some(400), height: Some(300), source: HintSource::Window });
    }

    #[test]
    fn test_invalid_window_pair_falls_through_to_config() {
        let code = "Window.size = (0, 300)\nConfig.set('graphics', 'height', '500')";
        let hint = inspector().parse_display_hint(code);
        assert_eq!(hint.width, None);
        assert_eq!(hint.height, Some(500));
        assert_eq!(hint.source, HintSource::Config);
    }

    #[test]
    fn test_last_config_statement_wins_per_dimension() {
        let code = "Config.set('graphics', 'height', '300')\nConfig.set('graphics', 'width', '640')\nConfig.set('graphics', 'height', '500')";
        let hint = inspector().parse_display_hint(code);
        assert_eq!(hint.width, Some(640));
        assert_eq!(hint.height, Some(500));
        assert_eq!(hint.source, HintSource::Config);
    }

    #[test]
    fn test_non_positive_values_fall_back_to_none() {
        let ins = inspector();
        assert_eq!(ins.parse_display_hint("Config.set('graphics', 'width', '0')"), DisplayHint::none());
        assert_eq!(ins.parse_display_hint("Window.size = (-100, -200)"), DisplayHint::none());
        assert_eq!(ins.parse_display_hint("no sizing here"), DisplayHint::none());
    }

    #[test]
    fn test_danger_scan_reports_first_match() {
        let ins = inspector();
        let code = "import os\neval('2 + 2')";
        assert_eq!(ins.scan_danger(code), Some("import os"));
        assert_eq!(ins.scan_danger("from kivy.app import App\nApp().run()"), None);
    }

    #[test]
    fn test_danger_scan_respects_settings_toggle() {
        let code = "import subprocess";
        assert_eq!(inspector().scan_danger(code), Some("import subprocess"));
        assert_eq!(lenient_inspector().scan_danger(code), None);
    }
}
