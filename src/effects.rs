use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoGeometry {
    pub width: u32,
    pub height: u32,
}

impl VideoGeometry {
    // 49% of the source height, floored. Anything larger would let
    // top+bottom crops consume the whole frame.
    pub fn max_crop_per_side(&self) -> u32 {
        (self.height as f64 * 0.49).floor() as u32
    }
}

/// Snapshot of every toggleable visual effect, consumed read-only by the
/// filter-graph builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectConfig {
    pub frame_enabled: bool,
    crop_top_px: u32,
    crop_bottom_px: u32,
    crop_sync: bool,
    pub bg_darkness_pct: u32,
    pub bg_blur_px: u32,
    pub bg_scale_pct: u32,
    pub background_video_path: Option<PathBuf>,
    pub watermark_video_path: Option<PathBuf>,
    pub flip_enabled: bool,
    pub brightness_enabled: bool,
    pub brightness_pct: u32,
}

impl Default for EffectConfig {
    fn default() -> Self {
        Self {
            frame_enabled: false,
            crop_top_px: 100,
            crop_bottom_px: 100,
            crop_sync: true,
            bg_darkness_pct: 50,
            bg_blur_px: 10,
            bg_scale_pct: 120,
            background_video_path: None,
            watermark_video_path: None,
            flip_enabled: false,
            brightness_enabled: false,
            brightness_pct: 0,
        }
    }
}

impl EffectConfig {
    pub fn crop_top_px(&self) -> u32 {
        self.crop_top_px
    }

    pub fn crop_bottom_px(&self) -> u32 {
        self.crop_bottom_px
    }

    pub fn crop_sync(&self) -> bool {
        self.crop_sync
    }

    // Clamped to the geometry bound when known. With crop_sync on, the
    // other side mirrors the result.
    pub fn set_crop_top(&mut self, px: u32, geometry: Option<&VideoGeometry>) {
        let px = clamp_crop(px, geometry);
        self.crop_top_px = px;
        if self.crop_sync {
            self.crop_bottom_px = px;
        }
    }

    pub fn set_crop_bottom(&mut self, px: u32, geometry: Option<&VideoGeometry>) {
        let px = clamp_crop(px, geometry);
        self.crop_bottom_px = px;
        if self.crop_sync {
            self.crop_top_px = px;
        }
    }

    // Turning sync on snaps the bottom crop to the top value.
    pub fn set_crop_sync(&mut self, sync: bool) {
        self.crop_sync = sync;
        if sync {
            self.crop_bottom_px = self.crop_top_px;
        }
    }

    // Values entered before the probe finished may exceed the bound.
    pub fn clamp_to_geometry(&mut self, geometry: &VideoGeometry) {
        let max = geometry.max_crop_per_side();
        self.crop_top_px = self.crop_top_px.min(max);
        self.crop_bottom_px = self.crop_bottom_px.min(max);
    }

    pub fn set_bg_darkness_pct(&mut self, pct: u32) {
        self.bg_darkness_pct = pct.min(100);
    }

    pub fn set_bg_blur_px(&mut self, px: u32) {
        self.bg_blur_px = px.min(100);
    }

    pub fn set_bg_scale_pct(&mut self, pct: u32) {
        self.bg_scale_pct = pct.clamp(100, 200);
    }

    pub fn set_brightness_pct(&mut self, pct: u32) {
        self.brightness_pct = pct.min(100);
    }

    /// Copy with overlay paths that do not point to existing files cleared.
    /// The filter-graph builder never touches the filesystem; the job layer
    /// resolves path existence up front with this.
    pub fn with_missing_overlays_cleared(&self) -> Self {
        let mut resolved = self.clone();
        if let Some(path) = &resolved.background_video_path {
            if !path.is_file() {
                resolved.background_video_path = None;
            }
        }
        if let Some(path) = &resolved.watermark_video_path {
            if !path.is_file() {
                resolved.watermark_video_path = None;
            }
        }
        resolved
    }
}

fn clamp_crop(px: u32, geometry: Option<&VideoGeometry>) -> u32 {
    match geometry {
        Some(g) => px.min(g.max_crop_per_side()),
        None => px,
    }
}
