//! Cells whose kernel is too large to splat during the first pass.

use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::debug;

use crate::{
    constants::CELL_MESSAGE_VERSION,
    error::{RenderError, Result},
    geometry::{Cell, PhysicalBox},
    partition::ImagePartition,
};

/// Inclusive range of sample indices touched by a kernel along each axis.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SampleBox {
    /// Smallest `(w, h, k)` index.
    pub min: [usize; 3],
    /// Largest `(w, h, k)` index.
    pub max: [usize; 3],
}

impl SampleBox {
    /// Number of candidate samples inside the box.
    pub fn num_samples(&self) -> usize {
        (0..3).map(|axis| self.max[axis] - self.min[axis] + 1).product()
    }

    /// Return true if `(w, h, k)` lies inside the box.
    pub fn contains(&self, index: [usize; 3]) -> bool {
        (0..3).all(|axis| index[axis] >= self.min[axis] && index[axis] <= self.max[axis])
    }
}

struct DeferredCell {
    cell: Cell,
    sample_box: SampleBox,
}

/// Deferred cells together with the samples they are expected to touch.
#[derive(Default)]
pub struct CellList {
    cells: Vec<DeferredCell>,
}

impl CellList {
    /// An empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Defer `cell`, whose kernel covers `sample_box`.
    pub fn push(&mut self, cell: Cell, sample_box: SampleBox) {
        self.cells.push(DeferredCell { cell, sample_box });
    }

    /// Number of deferred cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Return true if no cell was deferred.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Iterate over the deferred cells.
    pub fn cells(&self) -> impl Iterator<Item = &Cell> {
        self.cells.iter().map(|deferred| &deferred.cell)
    }

    /// Remove all cells, handing them back in insertion order.
    pub fn take_cells(&mut self) -> Vec<Cell> {
        self.cells.drain(..).map(|deferred| deferred.cell).collect()
    }

    /// Number of candidate samples the deferred cells will touch on each scanline.
    ///
    /// Added to [crate::volume::Volume::estimate_number_of_samples_per_scanline]
    /// before the image is partitioned.
    pub fn estimate_number_of_samples_per_scanline(&self, height: usize) -> Vec<usize> {
        let mut samples = vec![0; height];
        for deferred in &self.cells {
            let SampleBox { min, max } = deferred.sample_box;
            let per_scanline = (max[0] - min[0] + 1) * (max[2] - min[2] + 1);
            for count in samples
                .iter_mut()
                .take(max[1] + 1)
                .skip(min[1])
            {
                *count += per_scanline;
            }
        }
        samples
    }

    /// Serialize the cells into one message per partition.
    ///
    /// A cell is sent to every partition its scanlines overlap, so a large
    /// cell may be sent more than once.
    pub fn construct_messages(&self, partition: &ImagePartition) -> Result<Vec<Vec<u8>>> {
        let nparts = partition.num_partitions();
        let mut targets = vec![Vec::<&Cell>::new(); nparts];

        for deferred in &self.cells {
            let first = deferred.sample_box.min[1];
            let last = deferred.sample_box.max[1];
            if first >= partition.height() {
                continue;
            }
            let first_partition = partition.partition_for_scanline(first);
            let last_partition = partition.partition_for_scanline(last.min(partition.height() - 1));
            for target in &mut targets[first_partition..=last_partition] {
                target.push(&deferred.cell);
            }
        }

        let mut messages = Vec::with_capacity(nparts);
        for cells in targets {
            let mut message = Vec::new();
            message.write_u32::<LittleEndian>(CELL_MESSAGE_VERSION)?;
            message.write_u32::<LittleEndian>(cells.len() as u32)?;
            for cell in cells {
                encode_cell(&mut message, cell)?;
            }
            messages.push(message);
        }

        Ok(messages)
    }

    /// Decode cell messages.
    ///
    /// The received cells do not carry a sample box. They are returned for the
    /// second extraction pass on the receiving rank.
    pub fn extract_cells<'a, I>(messages: I) -> Result<Vec<Cell>>
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut cells = Vec::new();
        for message in messages {
            let mut reader = Cursor::new(message);
            let version = read_u32(&mut reader)?;
            if version != CELL_MESSAGE_VERSION {
                return Err(RenderError::MalformedMessage(format!(
                    "unsupported cell message version {}",
                    version
                )));
            }
            let count = read_u32(&mut reader)?;
            for _ in 0..count {
                cells.push(decode_cell(&mut reader)?);
            }
        }
        debug!("received {} deferred cells", cells.len());
        Ok(cells)
    }
}

fn encode_cell<W: Write>(writer: &mut W, cell: &Cell) -> Result<()> {
    for coord in cell.bounds().coordinates() {
        writer.write_f64::<LittleEndian>(coord)?;
    }
    writer.write_u32::<LittleEndian>(cell.values().len() as u32)?;
    for &value in cell.values() {
        writer.write_f64::<LittleEndian>(value)?;
    }
    Ok(())
}

fn decode_cell<R: Read>(reader: &mut R) -> Result<Cell> {
    let mut coords = [0.0; 6];
    for coord in coords.iter_mut() {
        *coord = read_f64(reader)?;
    }
    let nvalues = read_u32(reader)?;
    let values = (0..nvalues)
        .map(|_| read_f64(reader))
        .collect::<Result<Vec<_>>>()?;
    Ok(Cell::new(PhysicalBox::new(coords), values))
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    reader
        .read_u32::<LittleEndian>()
        .map_err(|_| RenderError::MalformedMessage("truncated cell message".to_string()))
}

fn read_f64<R: Read>(reader: &mut R) -> Result<f64> {
    reader
        .read_f64::<LittleEndian>()
        .map_err(|_| RenderError::MalformedMessage("truncated cell message".to_string()))
}
