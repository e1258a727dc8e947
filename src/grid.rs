use std::ops::{Index, IndexMut};

pub type Coord = [usize; 3];

/// Dense 3D array with x varying fastest in the linear storage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Grid3<T> {
    sizes: Coord,
    data: Vec<T>,
}

pub type OccupancyGrid = Grid3<bool>;

impl<T: Clone> Grid3<T> {
    pub fn new(sizes: Coord, fill: T) -> Self {
        let total = sizes[0] * sizes[1] * sizes[2];
        Self {
            sizes,
            data: vec![fill; total],
        }
    }
}

impl<T> Grid3<T> {
    pub fn sizes(&self) -> Coord {
        self.sizes
    }

    pub fn total(&self) -> usize {
        self.data.len()
    }

    pub fn linear(&self) -> &[T] {
        &self.data
    }

    pub fn linear_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn ind2coord(&self, mut i: usize) -> Coord {
        let mut coord = [0; 3];
        for d in 0..3 {
            coord[d] = i % self.sizes[d];
            i /= self.sizes[d];
        }
        coord
    }

    pub fn coord2ind(&self, coord: Coord) -> Option<usize> {
        if !self.in_bounds(coord) {
            return None;
        }
        Some(coord[0] + self.sizes[0] * (coord[1] + self.sizes[1] * coord[2]))
    }

    pub fn in_bounds(&self, coord: Coord) -> bool {
        (0..3).all(|d| coord[d] < self.sizes[d])
    }

    pub fn get(&self, coord: Coord) -> Option<&T> {
        self.coord2ind(coord).map(|i| &self.data[i])
    }

    /// Signed lookup; anything outside the grid is `None`.
    pub fn get_signed(&self, coord: [i64; 3]) -> Option<&T> {
        if coord.iter().any(|&c| c < 0) {
            return None;
        }
        self.get([coord[0] as usize, coord[1] as usize, coord[2] as usize])
    }
}

impl<T> Index<Coord> for Grid3<T> {
    type Output = T;

    fn index(&self, coord: Coord) -> &T {
        match self.coord2ind(coord) {
            Some(i) => &self.data[i],
            None => panic!("grid coordinate {:?} out of bounds {:?}", coord, self.sizes),
        }
    }
}

impl<T> IndexMut<Coord> for Grid3<T> {
    fn index_mut(&mut self, coord: Coord) -> &mut T {
        match self.coord2ind(coord) {
            Some(i) => &mut self.data[i],
            None => panic!("grid coordinate {:?} out of bounds {:?}", coord, self.sizes),
        }
    }
}

/// Voxelised ball. Cell centres sit half a unit off the lattice, and the 0.1 slack
/// pulls in boundary cells so the surface has no pinholes.
pub fn gen_sphere(radius: f32) -> OccupancyGrid {
    let side = (radius * 2.0).ceil() as usize;
    let mut sphere = Grid3::new([side; 3], false);
    let limit = (radius + 0.1).powi(2);

    for i in 0..sphere.total() {
        let coord = sphere.ind2coord(i);
        let dist_sq: f32 = coord
            .iter()
            .map(|&c| (c as f32 - radius + 0.5).powi(2))
            .sum();
        sphere.linear_mut()[i] = dist_sq <= limit;
    }

    sphere
}
