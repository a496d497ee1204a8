//! HTML rendering of spawn errors.
//!
//! Two modes: *with details* embeds the full diagnostics spec as JSON for
//! the interactive error page; *without details* shows only the human
//! summary. Both are plain `{{KEY}}` substitutions into static templates;
//! the templates contain no conditional logic.

use crate::errors::{escape_html, SpawnError};
use crate::journey::JourneyType;
use serde_json::json;

const WITH_DETAILS_TEMPLATE: &str = include_str!("templates/with_details.html.template");
const WITHOUT_DETAILS_TEMPLATE: &str = include_str!("templates/without_details.html.template");
const STYLE_CSS: &str = include_str!("templates/style.css");
const PAGE_JS: &str = include_str!("templates/page.js");

const PAGE_TITLE: &str = "Web application could not be started";

pub struct ErrorRenderer;

impl ErrorRenderer {
    /// Render the full diagnostics page: program identity, journey, error
    /// basic info, and the per-participant diagnostics sections.
    pub fn render_with_details(error: &SpawnError) -> String {
        let mut diagnostics = json!({
            "system_wide": error.inspect_system_wide_details_as_json(),
            "core_process": error.inspect_parent_process_details_as_json(),
            "subprocess": error.inspect_subprocess_details_as_json(),
        });
        if error.journey().journey_type() == JourneyType::SpawnThroughPreloader {
            diagnostics["preloader_process"] = error.inspect_preloader_process_details_as_json();
        }

        let spec = json!({
            "program_name": env!("CARGO_PKG_NAME"),
            "program_version": env!("CARGO_PKG_VERSION"),
            "journey": error.journey().inspect_as_json(),
            "error": error.inspect_basic_info_as_json(),
            "diagnostics": diagnostics,
        });
        let spec_text = serde_json::to_string_pretty(&spec)
            .unwrap_or_else(|_| "{}".to_string());

        apply_template(
            WITH_DETAILS_TEMPLATE,
            &[
                ("CSS", STYLE_CSS),
                ("JS", PAGE_JS),
                ("TITLE", PAGE_TITLE),
                ("SUMMARY", &escape_html(error.summary())),
                ("PROBLEM_HTML", error.problem_description_html()),
                ("SOLUTION_HTML", error.solution_description_html()),
                ("SPEC", &escape_html(&spec_text)),
            ],
        )
    }

    /// Render the summary-only page shown when detailed diagnostics are
    /// withheld from end users.
    pub fn render_without_details(error: &SpawnError) -> String {
        apply_template(
            WITHOUT_DETAILS_TEMPLATE,
            &[
                ("CSS", STYLE_CSS),
                ("JS", PAGE_JS),
                ("TITLE", PAGE_TITLE),
                ("SUMMARY", &escape_html(error.summary())),
            ],
        )
    }
}

/// Replace every `{{KEY}}` placeholder with its value. Unknown placeholders
/// are left untouched so a template typo is visible instead of silent.
fn apply_template(template: &str, params: &[(&str, &str)]) -> String {
    let mut result = template.to_string();
    for (key, value) in params {
        result = result.replace(&format!("{{{{{}}}}}", key), value);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpawnConfig;
    use crate::errors::ErrorCategory;
    use crate::journey::Journey;

    fn test_error(journey_type: JourneyType) -> SpawnError {
        let config = SpawnConfig {
            app_root: "/var/www/app".to_string(),
            app_env: "production".to_string(),
            start_command: "ruby start.rb".to_string(),
            ..SpawnConfig::default()
        };
        let mut error = SpawnError::new(
            ErrorCategory::InternalError,
            Journey::new(journey_type, false),
            &config,
        );
        error.set_summary("could not do the thing");
        error.finalize()
    }

    #[test]
    fn apply_template_substitutes_all_occurrences() {
        let out = apply_template("{{A}} and {{B}} and {{A}}", &[("A", "x"), ("B", "y")]);
        assert_eq!(out, "x and y and x");
    }

    #[test]
    fn apply_template_leaves_unknown_keys() {
        let out = apply_template("{{KNOWN}} {{UNKNOWN}}", &[("KNOWN", "v")]);
        assert_eq!(out, "v {{UNKNOWN}}");
    }

    #[test]
    fn with_details_embeds_summary_and_journey() {
        let html = ErrorRenderer::render_with_details(&test_error(JourneyType::SpawnDirectly));
        assert!(html.contains("could not do the thing"));
        assert!(html.contains("SPAWN_DIRECTLY"));
        assert!(!html.contains("{{SPEC}}"));
        assert!(!html.contains("{{TITLE}}"));
    }

    #[test]
    fn with_details_includes_preloader_section_only_for_preloader_journeys() {
        let direct = ErrorRenderer::render_with_details(&test_error(JourneyType::SpawnDirectly));
        assert!(!direct.contains("preloader_process"));
        let smart =
            ErrorRenderer::render_with_details(&test_error(JourneyType::SpawnThroughPreloader));
        assert!(smart.contains("preloader_process"));
    }

    #[test]
    fn without_details_omits_diagnostics() {
        let html = ErrorRenderer::render_without_details(&test_error(JourneyType::SpawnDirectly));
        assert!(html.contains("could not do the thing"));
        assert!(!html.contains("diagnostics"));
    }
}
