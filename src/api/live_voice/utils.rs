//! Small sample-processing helpers shared by capture and playback

/// Average interleaved frames down to mono
pub fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Simple linear resampling (good enough for speech)
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let new_len = ((samples.len() as f64) * ratio).round() as usize;
    let last = samples.len() - 1;

    (0..new_len)
        .map(|i| {
            let src_idx = i as f64 / ratio;
            let idx0 = (src_idx as usize).min(last);
            let idx1 = (idx0 + 1).min(last);
            let frac = (src_idx - idx0 as f64) as f32;
            let s0 = samples[idx0];
            let s1 = samples[idx1];
            s0 + (s1 - s0) * frac
        })
        .collect()
}

/// Root-mean-square level, used for the input volume meter
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64).powi(2)).sum();
    (sum_sq / samples.len() as f64).sqrt() as f32
}
