use bytemuck::{Pod, Zeroable};

use crate::grid::{Coord, Grid3, OccupancyGrid};

/// Index of an occupied cell. Stable for the lifetime of a `VoxelStorage`, and the
/// same index addresses that cell's records in every device buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId(pub u32);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CornerId(pub u32);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FaceId(pub u32);

impl CellId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl CornerId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl FaceId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Wire sentinel for a missing link in device records.
pub const NO_LINK: i32 = -1;

fn link_to_wire(link: Option<CellId>) -> i32 {
    link.map_or(NO_LINK, |id| id.0 as i32)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Side {
    NegX,
    NegY,
    NegZ,
    PosX,
    PosY,
    PosZ,
}

impl Side {
    /// Neighbor slot order of `Cell::neighbors`.
    pub const ALL: [Side; 6] = [
        Side::NegX,
        Side::NegY,
        Side::NegZ,
        Side::PosX,
        Side::PosY,
        Side::PosZ,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn axis(self) -> usize {
        self.index() % 3
    }

    pub fn is_positive(self) -> bool {
        self.index() >= 3
    }

    pub fn opposite(self) -> Side {
        Side::ALL[(self.index() + 3) % 6]
    }

    pub fn negative(axis: usize) -> Side {
        Side::ALL[axis]
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cell {
    pub position: Coord,
    pub neighbors: [Option<CellId>; 6],
}

impl Cell {
    pub fn neighbor(&self, side: Side) -> Option<CellId> {
        self.neighbors[side.index()]
    }

    pub fn is_surface(&self) -> bool {
        self.neighbors.iter().any(Option::is_none)
    }
}

/// Lattice point on the solid/air boundary.
///
/// `cells` is ordered mmm, mmp, mpm, mpp, pmm, pmp, ppm, ppp where slot bit 0 picks
/// the x side, bit 1 y and bit 2 z. A clear bit means the cell lies on the minus side
/// of the corner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CornerVertex {
    pub position: Coord,
    pub cells: [Option<CellId>; 8],
}

impl CornerVertex {
    pub fn filled_slots(&self) -> usize {
        self.cells.iter().filter(|c| c.is_some()).count()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Face {
    /// Start corner, +axis1, +axis1+axis2, +axis2.
    pub corners: [CornerId; 4],
    pub cell: CellId,
    pub side: Side,
}

#[repr(C)]
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct CellRecord {
    pub neighbors: [i32; 6],
}

#[repr(C)]
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct CornerRecord {
    pub cells: [i32; 8],
}

/// Surface structure extracted from an occupancy grid.
///
/// All arrays are append-only and in scan order; device buffers mirror this order
/// exactly, so nothing here may ever be reordered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VoxelStorage {
    cells: Vec<Cell>,
    corners: Vec<CornerVertex>,
    faces: Vec<Face>,
}

impl VoxelStorage {
    pub fn extract(grid: &OccupancyGrid) -> Self {
        let sizes = grid.sizes();
        let mut cells: Vec<Cell> = Vec::new();
        let mut index_map: Grid3<Option<CellId>> = Grid3::new(sizes, None);

        for i in 0..grid.total() {
            if !grid.linear()[i] {
                continue;
            }
            let coord = grid.ind2coord(i);
            let id = CellId(cells.len() as u32);
            cells.push(Cell {
                position: coord,
                neighbors: [None; 6],
            });
            index_map.linear_mut()[i] = Some(id);

            // Scan order guarantees every negative neighbor was visited already.
            for axis in 0..3 {
                if coord[axis] == 0 {
                    continue;
                }
                let mut neighbor_coord = coord;
                neighbor_coord[axis] -= 1;
                if !grid[neighbor_coord] {
                    continue;
                }
                let neighbor = index_map[neighbor_coord]
                    .expect("negative neighbors are visited before their positive partners");
                cells[id.index()].neighbors[Side::negative(axis).index()] = Some(neighbor);
                let back = Side::negative(axis).opposite();
                cells[neighbor.index()].neighbors[back.index()] = Some(id);
            }
        }

        let corner_sizes = [sizes[0] + 1, sizes[1] + 1, sizes[2] + 1];
        let mut corners = Vec::new();
        let mut corner_map: Grid3<Option<CornerId>> = Grid3::new(corner_sizes, None);

        for z in 0..corner_sizes[2] {
            for y in 0..corner_sizes[1] {
                for x in 0..corner_sizes[0] {
                    let mut slots = [None; 8];
                    for (slot, cell) in slots.iter_mut().enumerate() {
                        let cube = [
                            x as i64 - i64::from(slot & 1 == 0),
                            y as i64 - i64::from(slot & 2 == 0),
                            z as i64 - i64::from(slot & 4 == 0),
                        ];
                        *cell = index_map.get_signed(cube).copied().flatten();
                    }
                    let all_solid = slots.iter().all(Option::is_some);
                    let all_air = slots.iter().all(Option::is_none);
                    if all_solid || all_air {
                        continue;
                    }
                    corner_map[[x, y, z]] = Some(CornerId(corners.len() as u32));
                    corners.push(CornerVertex {
                        position: [x, y, z],
                        cells: slots,
                    });
                }
            }
        }

        let mut faces = Vec::new();
        for (i, cell) in cells.iter().enumerate() {
            for side in Side::ALL {
                if cell.neighbor(side).is_some() {
                    continue;
                }
                let axis = side.axis();
                let axis1 = (axis + 1) % 3;
                let axis2 = (axis + 2) % 3;

                let mut corner_pos = cell.position;
                corner_pos[axis] += usize::from(side.is_positive());
                let mut quad = [CornerId(0); 4];
                for (k, corner) in quad.iter_mut().enumerate() {
                    let mut pos = corner_pos;
                    pos[axis1] += usize::from(k == 1 || k == 2);
                    pos[axis2] += usize::from(k == 2 || k == 3);
                    *corner = corner_map[pos]
                        .expect("every corner of an exposed face lies on the surface");
                }
                faces.push(Face {
                    corners: quad,
                    cell: CellId(i as u32),
                    side,
                });
            }
        }

        let storage = Self {
            cells,
            corners,
            faces,
        };
        debug_assert!(storage.links_are_symmetric());
        storage
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn corners(&self) -> &[CornerVertex] {
        &self.corners
    }

    pub fn faces(&self) -> &[Face] {
        &self.faces
    }

    pub fn cell(&self, id: CellId) -> &Cell {
        &self.cells[id.index()]
    }

    pub fn face(&self, id: FaceId) -> Option<&Face> {
        self.faces.get(id.index())
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    pub fn corner_count(&self) -> usize {
        self.corners.len()
    }

    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    pub fn faces_of(&self, cell: CellId) -> impl Iterator<Item = (FaceId, &Face)> + '_ {
        self.faces
            .iter()
            .enumerate()
            .filter(move |(_, face)| face.cell == cell)
            .map(|(i, face)| (FaceId(i as u32), face))
    }

    /// Cells with at least one exposed side.
    pub fn surface_cells(&self) -> impl Iterator<Item = CellId> + '_ {
        self.cells
            .iter()
            .enumerate()
            .filter(|(_, cell)| cell.is_surface())
            .map(|(i, _)| CellId(i as u32))
    }

    pub fn links_are_symmetric(&self) -> bool {
        self.cells.iter().enumerate().all(|(i, cell)| {
            Side::ALL.iter().all(|&side| match cell.neighbor(side) {
                Some(other) => self.cell(other).neighbor(side.opposite()) == Some(CellId(i as u32)),
                None => true,
            })
        })
    }

    pub fn cell_records(&self) -> Vec<CellRecord> {
        self.cells
            .iter()
            .map(|cell| CellRecord {
                neighbors: cell.neighbors.map(link_to_wire),
            })
            .collect()
    }

    pub fn corner_records(&self) -> Vec<CornerRecord> {
        self.corners
            .iter()
            .map(|corner| CornerRecord {
                cells: corner.cells.map(link_to_wire),
            })
            .collect()
    }

    pub fn face_indices(&self) -> Vec<[u32; 4]> {
        self.faces
            .iter()
            .map(|face| face.corners.map(|c| c.0))
            .collect()
    }

    pub fn face_cells(&self) -> Vec<u32> {
        self.faces.iter().map(|face| face.cell.0).collect()
    }
}
