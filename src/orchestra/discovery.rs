use log::info;

use crate::{
    compute::{Backend, Platform},
    error::{HordeError, Result},
};

/// Picks the platform exposing the most devices and opens all of them.
///
/// Ties go to the platform listed first. There is no retry: without a usable
/// device the horde can't run at all.
///
/// # Arguments
/// * `platforms` - Every installed platform.
///
/// # Returns
/// The opened devices of the chosen platform, `NoPlatform` or `NoDevice`.
pub fn discover<P: Platform>(platforms: &[P]) -> Result<Vec<P::Device>> {
    if platforms.is_empty() {
        return Err(HordeError::NoPlatform);
    }

    let mut best: Option<&P> = None;
    for platform in platforms {
        info!(
            platform = platform.name(), devices = platform.device_count();
            "found compute platform"
        );
        if best.is_none_or(|best| platform.device_count() > best.device_count()) {
            best = Some(platform);
        }
    }

    let platform = match best {
        Some(platform) if platform.device_count() > 0 => platform,
        _ => return Err(HordeError::NoDevice),
    };

    let devices = platform.open()?;
    if devices.is_empty() {
        return Err(HordeError::NoDevice);
    }

    info!(platform = platform.name(); "using {} device(s)", devices.len());
    for (index, device) in devices.iter().enumerate() {
        info!(device = index; "{}", device.info());
    }

    Ok(devices)
}
