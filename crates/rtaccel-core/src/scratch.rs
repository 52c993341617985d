//! Build scratch memory.

use crate::device::{align_up, AccelerationDevice, BufferDesc, BufferUsage, DeviceAddress, DeviceBuffer};
use crate::error::AccelResult;

/// Smallest retained scratch allocation.
const MIN_RETAINED_SCRATCH: u64 = 1024 * 1024;

/// A scratch buffer whose address honours the device's scratch alignment.
#[derive(Debug)]
pub struct ScratchBuffer {
    buffer: DeviceBuffer,
    alignment: u64,
}

impl ScratchBuffer {
    /// Allocate at least `size` usable bytes.
    pub fn allocate<D: AccelerationDevice + ?Sized>(device: &D, size: u64, name: &str) -> AccelResult<Self> {
        let alignment = device.limits().scratch_alignment.max(1);
        let buffer = device.create_buffer(&BufferDesc {
            size: size.max(1) + alignment,
            usage: BufferUsage::Scratch,
            name,
        })?;
        Ok(Self { buffer, alignment })
    }

    /// Aligned start of the usable region.
    pub fn address(&self) -> DeviceAddress {
        DeviceAddress(align_up(self.buffer.address.0, self.alignment))
    }

    /// Usable bytes from [`ScratchBuffer::address`].
    pub fn capacity(&self) -> u64 {
        let padding = self.address().0 - self.buffer.address.0;
        self.buffer.size.saturating_sub(padding)
    }

    pub fn release<D: AccelerationDevice + ?Sized>(self, device: &D) {
        device.destroy_buffer(self.buffer);
    }
}

/// Make sure `slot` holds a scratch buffer of at least `min_size` bytes.
///
/// Grows to the next power of two so that slowly increasing scenes do not
/// reallocate every frame.
pub fn ensure_scratch<D: AccelerationDevice + ?Sized>(
    slot: &mut Option<ScratchBuffer>,
    device: &D,
    min_size: u64,
    name: &str,
) -> AccelResult<DeviceAddress> {
    let scratch = match slot.take() {
        Some(scratch) if scratch.capacity() >= min_size => scratch,
        old => {
            if let Some(old) = old {
                old.release(device);
            }
            let size = min_size.next_power_of_two().max(MIN_RETAINED_SCRATCH);
            log::debug!("{}: allocating {} scratch bytes", name, size);
            ScratchBuffer::allocate(device, size, name)?
        }
    };

    let address = scratch.address();
    *slot = Some(scratch);
    Ok(address)
}
