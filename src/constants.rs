//! Definition of constants.

/// Maximum number of variables a single ray can carry per sample.
pub const VARIABLE_LIMIT: usize = 10;

/// Number of ray slots reserved at once by a single memory block.
pub const RAYS_PER_BLOCK: usize = 1024;

/// Scale applied to the half diagonal of a cell to obtain its kernel radius.
pub const KERNEL_SCALE: f64 = 1.5;

/// Cells whose kernel touches more candidate samples than this are deferred
/// to the cell list when deferral is enabled.
pub const DEFERRAL_THRESHOLD: usize = 64;

/// Version tag of the volume sample message format.
pub const VOLUME_MESSAGE_VERSION: u32 = 1;

/// Version tag of the deferred cell message format.
pub const CELL_MESSAGE_VERSION: u32 = 1;

/// Version tag of the direct-send patch protocol.
pub const DIRECT_SEND_VERSION: i32 = 1;

/// Tag pair used by direct send. The first tag carries patch headers,
/// the second the pixel payload.
pub const DIRECT_SEND_TAGS: [i32; 2] = [1306, 1307];

/// Tag used by the binary swap rounds.
pub const BINARY_SWAP_TAG: i32 = 1410;

/// Number of `i32` values in a direct-send patch header.
pub const PATCH_HEADER_LEN: usize = 8;

/// Number of channels of an image pixel (RGBA).
pub const CHANNELS: usize = 4;
