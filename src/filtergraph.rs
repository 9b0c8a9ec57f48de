use crate::effects::{EffectConfig, VideoGeometry};

/// Synthesize the ffmpeg filter expression for an effect snapshot. `None`
/// means no effect is active, or the frame effect lacks known dimensions.
/// Pure; callers resolve overlay file existence beforehand
/// (`EffectConfig::with_missing_overlays_cleared`).
pub fn build(config: &EffectConfig, geometry: Option<&VideoGeometry>) -> Option<String> {
    let mut simple = Vec::new();
    if config.flip_enabled {
        simple.push("hflip".to_string());
    }
    if config.brightness_enabled && config.brightness_pct > 0 {
        let normalized = -(config.brightness_pct as f64) / 400.0;
        simple.push(format!("eq=brightness={normalized:.2}"));
    }
    let prefix = if simple.is_empty() {
        String::new()
    } else {
        format!("{},", simple.join(","))
    };

    if config.frame_enabled {
        let geometry = geometry?;
        return Some(frame_expression(config, geometry, &prefix));
    }

    if simple.is_empty() {
        None
    } else {
        Some(simple.join(","))
    }
}

fn frame_expression(config: &EffectConfig, geometry: &VideoGeometry, prefix: &str) -> String {
    let w = geometry.width;
    let h = geometry.height;
    let darkness = if config.bg_darkness_pct > 0 {
        -(config.bg_darkness_pct as f64) / 100.0 * 0.7
    } else {
        0.0
    };
    let blur = if config.bg_blur_px > 0 {
        config.bg_blur_px
    } else {
        1
    };
    let scale = config.bg_scale_pct as f64 / 100.0;
    let top = config.crop_top_px() as i64;
    let bottom = config.crop_bottom_px() as i64;

    let has_background = config.background_video_path.is_some();
    let has_watermark = config.watermark_video_path.is_some();

    match (has_background, has_watermark) {
        (true, true) => format!(
            "{prefix}\
             [1:v]scale={w}:ih*{scale:.2},boxblur=luma_radius={blur}:luma_power=2,eq=brightness={darkness:.2},crop={w}:{h}:0:0[bg];\
             [2:v]format=rgba,colorchannelmixer=aa=0.5,scale={w}:{h}[wm];\
             [bg][wm]overlay=(W-w)/2:(H-h)/2[bgwm];\
             [0:v]crop=iw:ih-{top}-{bottom}:0:{top}[fg];\
             [bgwm][fg]overlay=0:{top}"
        ),
        (false, true) => {
            let total = top + bottom;
            let offset = (bottom - top).div_euclid(2);
            format!(
                "{prefix}\
                 [0:v]split[main][bg];\
                 [bg]scale=iw*{scale:.2}:ih*{scale:.2},boxblur=luma_radius={blur}:luma_power=2,eq=brightness={darkness:.2}[bg_blurred];\
                 [1:v]format=rgba,colorchannelmixer=aa=0.5,scale={w}:{h}[wm];\
                 [bg_blurred][wm]overlay=(W-w)/2:(H-h)/2[bgwm];\
                 [main]crop=iw:ih-{total}:0:{top}[fg];\
                 [bgwm][fg]overlay=(W-w)/2:(H-h)/2-{offset}[combined];\
                 [combined]crop=iw/({scale:.2}):ih/({scale:.2}):iw/2-iw/(2*{scale:.2}):ih/2-ih/(2*{scale:.2})"
            )
        }
        (true, false) => format!(
            "{prefix}\
             [1:v]scale={w}:ih*{scale:.2},boxblur=luma_radius={blur}:luma_power=2,eq=brightness={darkness:.2},crop={w}:{h}:0:0[bg];\
             [0:v]crop=iw:ih-{top}-{bottom}:0:{top}[fg];\
             [bg][fg]overlay=0:{top}"
        ),
        (false, false) => {
            let total = top + bottom;
            let offset = (bottom - top).div_euclid(2);
            format!(
                "{prefix}split[main][bg];\
                 [bg]scale=iw*{scale:.2}:ih*{scale:.2},boxblur=luma_radius={blur}:luma_power=2,eq=brightness={darkness:.2}[bg_blurred];\
                 [main]crop=iw:ih-{total}:0:{top}[fg];\
                 [bg_blurred][fg]overlay=(W-w)/2:(H-h)/2-{offset}[combined];\
                 [combined]crop=iw/({scale:.2}):ih/({scale:.2}):iw/2-iw/(2*{scale:.2}):ih/2-ih/(2*{scale:.2})"
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const GEO: VideoGeometry = VideoGeometry {
        width: 1920,
        height: 1080,
    };

    fn frame_config() -> EffectConfig {
        let mut config = EffectConfig::default();
        config.frame_enabled = true;
        config
    }

    #[test]
    fn no_active_effect_yields_none() {
        let config = EffectConfig::default();
        assert_eq!(build(&config, Some(&GEO)), None);
        // Geometry alone never triggers an expression.
        assert_eq!(build(&config, None), None);
    }

    #[test]
    fn simple_filters_compose_without_frame() {
        let mut config = EffectConfig::default();
        config.flip_enabled = true;
        assert_eq!(build(&config, None).as_deref(), Some("hflip"));

        config.brightness_enabled = true;
        config.set_brightness_pct(40);
        assert_eq!(
            build(&config, None).as_deref(),
            Some("hflip,eq=brightness=-0.10")
        );
    }

    #[test]
    fn brightness_at_zero_is_inert() {
        let mut config = EffectConfig::default();
        config.brightness_enabled = true;
        config.set_brightness_pct(0);
        assert_eq!(build(&config, Some(&GEO)), None);
    }

    #[test]
    fn frame_without_geometry_yields_none() {
        let mut config = frame_config();
        config.flip_enabled = true;
        // Even with simple filters pending, the frame effect cannot be
        // expressed until the probe supplies dimensions.
        assert_eq!(build(&config, None), None);
    }

    #[test]
    fn self_background_case_splits_blurs_and_inverse_crops() {
        let config = frame_config();
        let expr = build(&config, Some(&GEO)).expect("expression");

        assert!(expr.starts_with("split[main][bg];"));
        assert!(expr.contains("boxblur=luma_radius=10:luma_power=2"));
        assert!(expr.contains("eq=brightness=-0.35"));
        assert!(expr.contains("[main]crop=iw:ih-200:0:100[fg]"));
        assert!(expr.contains("overlay=(W-w)/2:(H-h)/2-0[combined]"));
        assert!(expr.ends_with(
            "[combined]crop=iw/(1.20):ih/(1.20):iw/2-iw/(2*1.20):ih/2-ih/(2*1.20)"
        ));
    }

    #[test]
    fn self_background_offset_follows_asymmetric_crop() {
        let mut config = frame_config();
        config.set_crop_sync(false);
        config.set_crop_top(50, Some(&GEO));
        config.set_crop_bottom(150, Some(&GEO));

        let expr = build(&config, Some(&GEO)).expect("expression");
        assert!(expr.contains("[main]crop=iw:ih-200:0:50[fg]"));
        assert!(expr.contains("overlay=(W-w)/2:(H-h)/2-50[combined]"));
    }

    #[test]
    fn background_only_case_targets_exact_dimensions() {
        let mut config = frame_config();
        config.background_video_path = Some(PathBuf::from("bg.mp4"));

        let expr = build(&config, Some(&GEO)).expect("expression");
        assert!(expr.starts_with("[1:v]scale=1920:ih*1.20,"));
        assert!(expr.contains("crop=1920:1080:0:0[bg]"));
        assert!(expr.contains("[0:v]crop=iw:ih-100-100:0:100[fg]"));
        assert!(expr.ends_with("[bg][fg]overlay=0:100"));
        // No watermark chain and no inverse final crop in this case.
        assert!(!expr.contains("[wm]"));
        assert!(!expr.contains("[combined]"));
    }

    #[test]
    fn watermark_only_case_keeps_the_inverse_crop() {
        let mut config = frame_config();
        config.watermark_video_path = Some(PathBuf::from("wm.mp4"));

        let expr = build(&config, Some(&GEO)).expect("expression");
        assert!(expr.starts_with("[0:v]split[main][bg];"));
        assert!(expr.contains("[1:v]format=rgba,colorchannelmixer=aa=0.5,scale=1920:1080[wm]"));
        assert!(expr.contains("[bg_blurred][wm]overlay=(W-w)/2:(H-h)/2[bgwm]"));
        assert!(expr.ends_with(
            "[combined]crop=iw/(1.20):ih/(1.20):iw/2-iw/(2*1.20):ih/2-ih/(2*1.20)"
        ));
    }

    #[test]
    fn background_and_watermark_case_blends_both_overlays() {
        let mut config = frame_config();
        config.background_video_path = Some(PathBuf::from("bg.mp4"));
        config.watermark_video_path = Some(PathBuf::from("wm.mp4"));
        config.flip_enabled = true;

        let expr = build(&config, Some(&GEO)).expect("expression");
        assert!(expr.starts_with("hflip,[1:v]scale=1920:ih*1.20,"));
        assert!(expr.contains("[2:v]format=rgba,colorchannelmixer=aa=0.5,scale=1920:1080[wm]"));
        assert!(expr.contains("[bg][wm]overlay=(W-w)/2:(H-h)/2[bgwm]"));
        assert!(expr.ends_with("[bgwm][fg]overlay=0:100"));
    }

    #[test]
    fn darkness_zero_and_blur_zero_take_neutral_values() {
        let mut config = frame_config();
        config.set_bg_darkness_pct(0);
        config.set_bg_blur_px(0);

        let expr = build(&config, Some(&GEO)).expect("expression");
        assert!(expr.contains("boxblur=luma_radius=1:luma_power=2"));
        assert!(expr.contains("eq=brightness=0.00"));
    }

    #[test]
    fn build_is_deterministic_for_the_same_snapshot() {
        let config = frame_config();
        assert_eq!(build(&config, Some(&GEO)), build(&config, Some(&GEO)));
    }
}
