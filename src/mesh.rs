//! Turn VTK unstructured grids into [Cell]s for sampling.

use std::path::Path;

use itertools::Itertools;
use log::{debug, warn};
use vtkio::model::{
    Attribute, Attributes, DataArray, DataSet, IOBuffer, UnstructuredGridPiece, VertexNumbers, Vtk,
};

use crate::{
    error::{RenderError, Result},
    geometry::{Cell, PhysicalBox},
};

/// Load the cells of a legacy or XML VTK file.
///
/// `variable` names a scalar cell array, or a scalar point array which is
/// then averaged over the points of each cell.
pub fn load_cells<P: AsRef<Path>>(path: P, variable: &str) -> Result<Vec<Cell>> {
    let path = path.as_ref();
    let vtk = Vtk::import(path).map_err(|e| RenderError::Mesh(format!("{:?}", e)))?;
    debug!("loaded {}", path.display());
    cells_from_vtk(vtk, variable)
}

/// Parse the cells of a legacy VTK file held in memory.
pub fn parse_legacy_cells(data: &[u8], variable: &str) -> Result<Vec<Cell>> {
    let vtk = Vtk::parse_legacy_be(data).map_err(|e| RenderError::Mesh(format!("{:?}", e)))?;
    cells_from_vtk(vtk, variable)
}

/// Extract the cells of all unstructured grid pieces of `vtk`.
pub fn cells_from_vtk(mut vtk: Vtk, variable: &str) -> Result<Vec<Cell>> {
    vtk.load_all_pieces()
        .map_err(|e| RenderError::Mesh(format!("{:?}", e)))?;

    let DataSet::UnstructuredGrid { pieces, .. } = vtk.data else {
        return Err(RenderError::Mesh(
            "only unstructured grids are supported".to_string(),
        ));
    };

    let mut cells = Vec::new();
    for piece in pieces {
        let piece = piece
            .load_piece_data(None)
            .map_err(|e| RenderError::Mesh(format!("{:?}", e)))?;
        cells.extend(cells_from_piece(piece, variable)?);
    }

    debug!("extracted {} cells", cells.len());
    Ok(cells)
}

fn cells_from_piece(piece: UnstructuredGridPiece, variable: &str) -> Result<Vec<Cell>> {
    let points = to_f64(piece.points)
        .ok_or_else(|| RenderError::Mesh("points are not floating point".to_string()))?;
    let connectivity = connectivity(piece.cells.cell_verts);
    let num_points = points.len() / 3;
    if connectivity.iter().flatten().any(|&p| p >= num_points) {
        return Err(RenderError::Mesh(
            "a cell references a point that does not exist".to_string(),
        ));
    }

    let values = match find_scalars(&piece.data, variable) {
        Some((Location::Cell, values)) => {
            if values.len() != connectivity.len() {
                return Err(RenderError::Mesh(format!(
                    "cell array '{}' has {} values for {} cells",
                    variable,
                    values.len(),
                    connectivity.len()
                )));
            }
            values
        }
        Some((Location::Point, values)) if values.len() >= num_points => connectivity
            .iter()
            .map(|cell| {
                let sum: f64 = cell.iter().map(|&p| values[p]).sum();
                sum / cell.len().max(1) as f64
            })
            .collect_vec(),
        _ => {
            return Err(RenderError::Mesh(format!(
                "no usable scalar array named '{}'",
                variable
            )))
        }
    };

    let mut cells = Vec::with_capacity(connectivity.len());
    for (vertices, value) in connectivity.iter().zip(values) {
        if vertices.is_empty() {
            warn!("skipping cell without points");
            continue;
        }
        let coords = vertices
            .iter()
            .flat_map(|&p| [points[3 * p], points[3 * p + 1], points[3 * p + 2]])
            .collect_vec();
        cells.push(Cell::from_points(&coords, vec![value]));
    }

    Ok(cells)
}

/// Bounding box of a set of cells.
pub fn bounding_box(cells: &[Cell]) -> Option<PhysicalBox> {
    if cells.is_empty() {
        return None;
    }
    let corners = cells
        .iter()
        .flat_map(|cell| cell.bounds().coordinates())
        .collect_vec();
    Some(PhysicalBox::from_points(&corners))
}

enum Location {
    Cell,
    Point,
}

fn find_scalars(attributes: &Attributes, variable: &str) -> Option<(Location, Vec<f64>)> {
    let find = |list: &[Attribute]| {
        list.iter().find_map(|attribute| match attribute {
            Attribute::DataArray(DataArray { name, data, .. }) if name == variable => {
                to_f64(data.clone())
            }
            _ => None,
        })
    };

    find(&attributes.cell)
        .map(|values| (Location::Cell, values))
        .or_else(|| find(&attributes.point).map(|values| (Location::Point, values)))
}

fn to_f64(buffer: IOBuffer) -> Option<Vec<f64>> {
    match buffer {
        IOBuffer::F64(values) => Some(values),
        IOBuffer::F32(values) => Some(values.into_iter().map(f64::from).collect()),
        _ => None,
    }
}

fn connectivity(vertices: VertexNumbers) -> Vec<Vec<usize>> {
    match vertices {
        VertexNumbers::Legacy {
            num_cells,
            vertices,
        } => {
            let mut cells = Vec::with_capacity(num_cells as usize);
            let mut rest = &vertices[..];
            while let Some((&count, tail)) = rest.split_first() {
                let count = (count as usize).min(tail.len());
                cells.push(tail[..count].iter().map(|&v| v as usize).collect());
                rest = &tail[count..];
            }
            cells
        }
        VertexNumbers::XML {
            connectivity,
            offsets,
        } => {
            let mut start = 0;
            offsets
                .iter()
                .map(|&end| {
                    let cell = connectivity
                        .get(start..end as usize)
                        .unwrap_or_default()
                        .iter()
                        .map(|&v| v as usize)
                        .collect();
                    start = end as usize;
                    cell
                })
                .collect()
        }
    }
}
