//! ForEach launch configuration and the dispatcher seam.

use std::ffi::c_void;
use std::fmt;

use serde::Serialize;

use crate::allocation::{Allocation, Dims};
use crate::error::{Result, ScriptError};
use crate::metadata::ForEachSignature;
use crate::runtime::with_published;
use crate::script::Script;
use crate::symbols::ForEachFn;

/// Caller-requested sub-rectangle. An axis whose end is 0 covers the full
/// extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LaunchRange {
    pub x_start: u32,
    pub x_end: u32,
    pub y_start: u32,
    pub y_end: u32,
    pub z_start: u32,
    pub z_end: u32,
}

impl LaunchRange {
    pub fn x(start: u32, end: u32) -> Self {
        Self {
            x_start: start,
            x_end: end,
            ..Self::default()
        }
    }
}

/// Half-open iteration bounds actually launched. Every end is at least 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LaunchBounds {
    pub x_start: u32,
    pub x_end: u32,
    pub y_start: u32,
    pub y_end: u32,
    pub z_start: u32,
    pub z_end: u32,
}

impl LaunchBounds {
    pub fn cells(&self) -> u64 {
        u64::from(self.x_end - self.x_start)
            * u64::from(self.y_end - self.y_start)
            * u64::from(self.z_end - self.z_start)
    }
}

fn clamp_axis(axis: char, dim: u32, start: u32, end: u32) -> Result<Option<(u32, u32)>> {
    if end == 0 {
        return Ok(Some((0, dim)));
    }
    if start == end && end <= dim {
        return Ok(None);
    }
    if start >= dim || end > dim || end < start {
        return Err(ScriptError::Geometry(format!(
            "{axis} range [{start}, {end}) does not fit extent {dim}"
        )));
    }
    Ok(Some((start, end)))
}

/// Bounds for a launch over `dims`, or `None` when the requested range is
/// empty and nothing should run.
pub fn compute_launch_bounds(
    dims: Dims,
    range: Option<&LaunchRange>,
) -> Result<Option<LaunchBounds>> {
    let r = range.copied().unwrap_or_default();
    let Some((x_start, x_end)) = clamp_axis('x', dims.x, r.x_start, r.x_end)? else {
        return Ok(None);
    };
    let Some((y_start, y_end)) = clamp_axis('y', dims.y, r.y_start, r.y_end)? else {
        return Ok(None);
    };
    let Some((z_start, z_end)) = clamp_axis('z', dims.z, r.z_start, r.z_end)? else {
        return Ok(None);
    };
    Ok(Some(LaunchBounds {
        x_start,
        x_end: x_end.max(1),
        y_start,
        y_end: y_end.max(1),
        z_start,
        z_end: z_end.max(1),
    }))
}

/// Argument block handed to expanded kernels. Compiled kernels must be built
/// against this layout.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ForEachParams {
    /// Input element at the start of the current row segment.
    pub input: *const u8,
    /// Output element at the start of the current row segment.
    pub output: *mut u8,
    pub usr: *const c_void,
    pub usr_len: u32,
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub dim_x: u32,
    pub dim_y: u32,
    pub dim_z: u32,
    pub slot: u32,
    pub ptr_in: *const u8,
    pub e_stride_in: u32,
    pub y_stride_in: u32,
    pub ptr_out: *mut u8,
    pub e_stride_out: u32,
    pub y_stride_out: u32,
}

impl Default for ForEachParams {
    fn default() -> Self {
        Self {
            input: std::ptr::null(),
            output: std::ptr::null_mut(),
            usr: std::ptr::null(),
            usr_len: 0,
            x: 0,
            y: 0,
            z: 0,
            dim_x: 0,
            dim_y: 0,
            dim_z: 0,
            slot: 0,
            ptr_in: std::ptr::null(),
            e_stride_in: 0,
            y_stride_in: 0,
            ptr_out: std::ptr::null_mut(),
            e_stride_out: 0,
            y_stride_out: 0,
        }
    }
}

// Workers only read the block; the buffers behind it are owned by the
// allocations, which outlive the launch.
unsafe impl Send for ForEachParams {}
unsafe impl Sync for ForEachParams {}

impl ForEachParams {
    /// Address of column `x` in `row`, or null for an absent buffer.
    fn element(base: *const u8, e_stride: u32, y_stride: u32, row: u64, x: u32) -> *const u8 {
        if base.is_null() {
            return base;
        }
        let offset = row * u64::from(y_stride) + u64::from(x) * u64::from(e_stride);
        base.wrapping_add(offset as usize)
    }

    /// Points `input`/`output` at the first element of row `(y, z)` starting
    /// from column `x`.
    pub fn seek_row(&mut self, x: u32, y: u32, z: u32) {
        self.x = x;
        self.y = y;
        self.z = z;
        let row = u64::from(z) * u64::from(self.dim_y.max(1)) + u64::from(y);
        self.input = Self::element(self.ptr_in, self.e_stride_in, self.y_stride_in, row, x);
        self.output =
            Self::element(self.ptr_out, self.e_stride_out, self.y_stride_out, row, x) as *mut u8;
    }
}

/// Everything a dispatcher needs to run one ForEach launch.
pub struct LaunchDescriptor<'a> {
    pub script: &'a Script,
    pub params: ForEachParams,
    pub bounds: LaunchBounds,
    pub kernel: ForEachFn,
    pub signature: ForEachSignature,
    pub is_threadable: bool,
    /// Rows handed to a worker per grab.
    pub slice_size: u32,
}

impl fmt::Debug for LaunchDescriptor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchDescriptor")
            .field("script", &self.script.identity())
            .field("params", &self.params)
            .field("bounds", &self.bounds)
            .field("signature", &self.signature)
            .field("is_threadable", &self.is_threadable)
            .field("slice_size", &self.slice_size)
            .finish()
    }
}

#[derive(Debug)]
pub enum LaunchPlan<'a> {
    Dispatch(LaunchDescriptor<'a>),
    /// The requested range was empty; nothing runs.
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchOutcome {
    Dispatched,
    Skipped,
}

/// Parallel executor for ForEach launches. Returns once every cell has run.
///
/// Each thread that calls into the kernel must run it inside
/// [`with_published`] for the launching script.
pub trait Dispatcher: Send + Sync {
    fn dispatch(
        &self,
        input: Option<&dyn Allocation>,
        output: Option<&dyn Allocation>,
        range: Option<&LaunchRange>,
        launch: &LaunchDescriptor<'_>,
    );
}

/// Runs every row on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialDispatcher;

impl Dispatcher for SerialDispatcher {
    fn dispatch(
        &self,
        _input: Option<&dyn Allocation>,
        _output: Option<&dyn Allocation>,
        _range: Option<&LaunchRange>,
        launch: &LaunchDescriptor<'_>,
    ) {
        let b = launch.bounds;
        let mut params = launch.params;
        tracing::trace!(bounds = ?b, slot = params.slot, "serial dispatch");
        with_published(launch.script, || {
            for z in b.z_start..b.z_end {
                for y in b.y_start..b.y_end {
                    params.seek_row(b.x_start, y, z);
                    // SAFETY: the kernel was resolved from the launching
                    // script's module and the row pointers stay inside its
                    // allocations.
                    unsafe {
                        (launch.kernel)(
                            &params,
                            b.x_start,
                            b.x_end,
                            params.e_stride_in,
                            params.e_stride_out,
                        );
                    }
                }
            }
        });
    }
}
