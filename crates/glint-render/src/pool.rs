//! The intermediate texture pool.
//!
//! Renderable scratch textures are recycled across passes and frames.
//! Selection minimizes the orthogonal size difference, with a large
//! penalty for format mismatches; the chosen slot is recreated in place
//! when its dimensions or format differ from the request. Usage bits are
//! tracked by the caller per top-level planner call, so the same slot is
//! never handed out twice within one call.

use std::sync::Arc;

use tracing::trace;

use glint_gpu::{Format, FormatCaps, Gpu, GpuResult, SampleMode, TexParams, Texture};

/// Penalty applied to candidates whose format doesn't match the request.
const FORMAT_PENALTY: i64 = 1000;

/// A pool of recyclable render-target textures.
#[derive(Default)]
pub struct TexturePool {
    slots: Vec<Option<Arc<dyn Texture>>>,
}

impl TexturePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of slots ever allocated.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Acquires a texture of exactly `(w, h, format)`, reusing the closest
    /// unused slot. `used` is the per-call usage set; it is grown to match
    /// the pool and the selected slot is marked.
    pub fn get(
        &mut self,
        gpu: &dyn Gpu,
        used: &mut Vec<bool>,
        w: u32,
        h: u32,
        format: &Arc<Format>,
    ) -> GpuResult<Arc<dyn Texture>> {
        used.resize(self.slots.len(), false);

        let mut best: Option<(usize, i64)> = None;
        for (i, slot) in self.slots.iter().enumerate() {
            if used[i] {
                continue;
            }
            let diff = match slot {
                Some(tex) => {
                    let p = tex.params();
                    (p.w as i64 - w as i64).abs()
                        + (p.h as i64 - h as i64).abs()
                        + if p.format.is(format) { 0 } else { FORMAT_PENALTY }
                }
                // A previously failed slot; perfect candidate to recreate
                None => 0,
            };
            if best.map_or(true, |(_, b)| diff < b) {
                best = Some((i, diff));
            }
        }

        let idx = match best {
            Some((idx, _)) => idx,
            None => {
                self.slots.push(None);
                used.push(false);
                self.slots.len() - 1
            }
        };

        // Recreate in place unless the slot already matches exactly
        let matches = self.slots[idx].as_ref().is_some_and(|tex| {
            let p = tex.params();
            p.w == w && p.h == h && p.format.is(format)
        });
        if !matches {
            trace!("pool slot {idx}: (re)creating as {w}x{h} {}", format.name);
            self.slots[idx] = None;
            let params = TexParams {
                storable: format.caps.contains(FormatCaps::STORABLE),
                renderable: true,
                sample_mode: if format.caps.contains(FormatCaps::LINEAR) {
                    SampleMode::Linear
                } else {
                    SampleMode::Nearest
                },
                ..TexParams::new_2d(w, h, format.clone())
            };
            self.slots[idx] = Some(gpu.tex_create(&params)?);
        }

        used[idx] = true;
        Ok(self.slots[idx].clone().expect("slot was just created"))
    }

    /// Drops every pooled texture.
    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glint_gpu::SoftGpu;

    #[test]
    fn test_allocations_match_peak_concurrency() {
        let gpu = SoftGpu::new();
        let fmt = gpu.format("rgba16f");
        let mut pool = TexturePool::new();

        // Two calls with up to 2 concurrent textures each
        for _ in 0..3 {
            let mut used = Vec::new();
            let a = pool.get(&gpu, &mut used, 640, 480, &fmt).unwrap();
            let b = pool.get(&gpu, &mut used, 640, 480, &fmt).unwrap();
            assert!(!Arc::ptr_eq(&a, &b));
        }

        assert_eq!(pool.len(), 2);
        assert_eq!(gpu.tex_creates(), 2);
    }

    #[test]
    fn test_closest_slot_wins() {
        let gpu = SoftGpu::new();
        let fmt = gpu.format("rgba16f");
        let mut pool = TexturePool::new();

        let mut used = Vec::new();
        let big = pool.get(&gpu, &mut used, 1920, 1080, &fmt).unwrap();
        let small = pool.get(&gpu, &mut used, 64, 64, &fmt).unwrap();

        // A request near the big slot reuses it, not the small one
        let mut used = Vec::new();
        let got = pool.get(&gpu, &mut used, 1920, 1080, &fmt).unwrap();
        assert!(Arc::ptr_eq(&got, &big));
        let got = pool.get(&gpu, &mut used, 60, 66, &fmt).unwrap();
        assert!(!Arc::ptr_eq(&got, &small), "size mismatch forces recreation");
        assert_eq!(got.params().w, 60);
    }

    #[test]
    fn test_format_mismatch_penalty() {
        let gpu = SoftGpu::new();
        let f16 = gpu.format("rgba16f");
        let f8 = gpu.format("rgba8");
        let mut pool = TexturePool::new();

        let mut used = Vec::new();
        let exact = pool.get(&gpu, &mut used, 100, 100, &f16).unwrap();
        pool.get(&gpu, &mut used, 400, 400, &f8).unwrap();

        // Same size as the f16 slot, but in rgba8: the 400x400 rgba8 slot
        // wins (distance 600) over the exact-size f16 slot (penalty 1000)
        let mut used = Vec::new();
        let got = pool.get(&gpu, &mut used, 100, 100, &f8).unwrap();
        assert!(got.params().format.is(&f8));
        assert_eq!(pool.len(), 2, "no extra slot allocated");

        // The f16 slot was left alone
        let mut used = Vec::new();
        let back = pool.get(&gpu, &mut used, 100, 100, &f16).unwrap();
        assert!(Arc::ptr_eq(&back, &exact));
    }
}
