//! Native versions of the entry points in `kernels/horde.cl`.
//!
//! Weight buffers use the strided layout: feature `j` of demon `i` lives at
//! `i + j * stride`, where `stride` is the padded demon count.

use super::{HostArg, HostEntry, HostKernel};
use crate::config::Hyperparams;

const BUFFER: bool = true;
const INT: bool = false;

/// Checks the argument kinds against the entry point's parameter list.
pub(super) fn check_signature(entry: HostEntry, args: &[HostArg]) -> Result<(), String> {
    let expected: &[bool] = match entry {
        HostEntry::Initialise => &[BUFFER, BUFFER, BUFFER, INT],
        HostEntry::Update => &[
            BUFFER, BUFFER, BUFFER, BUFFER, BUFFER, BUFFER, BUFFER, BUFFER, BUFFER, INT,
        ],
        HostEntry::Predict => &[BUFFER, BUFFER, BUFFER, INT],
        HostEntry::TraceReset => &[BUFFER, INT],
    };

    let matches = args.len() == expected.len()
        && args
            .iter()
            .zip(expected)
            .all(|(arg, &is_buffer)| matches!(arg, HostArg::Buffer(_)) == is_buffer);

    if matches {
        Ok(())
    } else {
        Err(format!("expected {} arguments of the documented kinds", expected.len()))
    }
}

/// Runs `kernel` over the first `demons` demons.
pub(super) fn run(kernel: &HostKernel, demons: usize) -> Result<(), String> {
    let args = &kernel.args;
    let feature_dim = match args.last() {
        Some(HostArg::Int(n)) if *n > 0 => *n as usize,
        _ => return Err("feature dimension must be a positive int".to_string()),
    };

    match kernel.entry {
        HostEntry::Initialise => {
            for arg in &args[..3] {
                zero_columns(arg, demons, feature_dim)?;
            }
            Ok(())
        }
        HostEntry::TraceReset => zero_columns(&args[0], demons, feature_dim),
        HostEntry::Update => update(args, demons, feature_dim, kernel.hyperparams),
        HostEntry::Predict => predict(args, demons, feature_dim),
    }
}

fn stride(len: usize, demons: usize, feature_dim: usize) -> Result<usize, String> {
    let stride = len / feature_dim;
    if demons > stride {
        return Err(format!("{demons} demons don't fit a stride of {stride}"));
    }
    Ok(stride)
}

fn zero_columns(arg: &HostArg, demons: usize, feature_dim: usize) -> Result<(), String> {
    let mut data = buffer(arg)?.data.write();
    let stride = stride(data.len(), demons, feature_dim)?;

    for j in 0..feature_dim {
        data[j * stride..j * stride + demons].fill(0.);
    }
    Ok(())
}

/// One GTD(λ) step per demon, then the prediction of the previous features under
/// the updated weights.
fn update(
    args: &[HostArg],
    demons: usize,
    feature_dim: usize,
    h: Hyperparams,
) -> Result<(), String> {
    let x = snapshot(&args[3], feature_dim)?;
    let xp = snapshot(&args[4], feature_dim)?;
    let rho = snapshot(&args[5], demons)?;
    let reward = snapshot(&args[6], demons)?;
    let gamma = snapshot(&args[7], demons)?;

    let mut theta = buffer(&args[0])?.data.write();
    let mut w = buffer(&args[1])?.data.write();
    let mut trace = buffer(&args[2])?.data.write();
    let mut prediction = buffer(&args[8])?.data.write();

    let stride = stride(theta.len(), demons, feature_dim)?;
    if w.len() != theta.len() || trace.len() != theta.len() || prediction.len() < demons {
        return Err("weight buffers disagree in size".to_string());
    }

    for i in 0..demons {
        let at = |j: usize| i + j * stride;
        let dot = |v: &[f32], u: &[f32]| (0..feature_dim).map(|j| v[at(j)] * u[j]).sum::<f32>();

        let g = gamma[i];
        let delta = reward[i] + g * dot(&theta[..], &xp) - dot(&theta[..], &x);

        for j in 0..feature_dim {
            trace[at(j)] = rho[i] * (g * h.lambda * trace[at(j)] + x[j]);
        }

        let trace_w = (0..feature_dim).map(|j| trace[at(j)] * w[at(j)]).sum::<f32>();
        let w_x = dot(&w[..], &x);

        for j in 0..feature_dim {
            let e = trace[at(j)];
            theta[at(j)] += h.alpha * (delta * e - g * (1. - h.lambda) * trace_w * xp[j]);
            w[at(j)] += h.alpha * h.eta * (delta * e - w_x * x[j]);
        }

        prediction[i] = dot(&theta[..], &x);
    }

    Ok(())
}

fn predict(args: &[HostArg], demons: usize, feature_dim: usize) -> Result<(), String> {
    let x = snapshot(&args[1], feature_dim)?;
    let theta = buffer(&args[0])?.data.read();
    let mut prediction = buffer(&args[2])?.data.write();

    let stride = stride(theta.len(), demons, feature_dim)?;
    if prediction.len() < demons {
        return Err("prediction buffer too small".to_string());
    }

    for (i, p) in prediction.iter_mut().take(demons).enumerate() {
        *p = (0..feature_dim).map(|j| theta[i + j * stride] * x[j]).sum();
    }

    Ok(())
}

fn buffer(arg: &HostArg) -> Result<&super::HostBuffer, String> {
    match arg {
        HostArg::Buffer(buffer) => Ok(buffer),
        HostArg::Int(_) => Err("expected a buffer argument".to_string()),
    }
}

/// Copies the first `len` floats of an input buffer.
fn snapshot(arg: &HostArg, len: usize) -> Result<Vec<f32>, String> {
    let data = buffer(arg)?.data.read();
    data.get(..len)
        .map(<[f32]>::to_vec)
        .ok_or_else(|| format!("input buffer holds {} floats, needs {len}", data.len()))
}
