//! The map: a grid of cells plus the walkability graph built over it.

use crate::audio::MusicRng;
use crate::game::graph::Graph;
use crate::game::resources::ResourceKind;
use crate::game::units::NeuronKind;
use crate::shared::error::GameError;
use crate::util::{self, Position};
use rand::Rng;
use rand::rngs::StdRng;
use std::collections::BTreeMap;

/// Number of rectangular sections used for initial placement.
pub const NUM_SECTIONS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cell {
    Free,
    Hill,
    Neuron(NeuronKind),
    Resource(ResourceKind),
}

impl Cell {
    pub fn symbol(self) -> &'static str {
        match self {
            Cell::Free => "\u{2219}",
            Cell::Hill => " ",
            Cell::Neuron(NeuronKind::Nucleus) => "\u{03A7}",
            Cell::Neuron(NeuronKind::Synapse) => "\u{039E}",
            Cell::Neuron(NeuronKind::ActivatedNeuron) => "\u{03A6}",
            Cell::Neuron(NeuronKind::ResourceNeuron) => "\u{2219}",
            Cell::Resource(kind) => kind.symbol(),
        }
    }
}

pub struct Field {
    lines: i32,
    cols: i32,
    cells: Vec<Vec<Cell>>,
    graph: Graph,
}

impl Field {
    pub fn new(lines: i32, cols: i32) -> Self {
        Self {
            lines,
            cols,
            cells: vec![vec![Cell::Free; cols as usize]; lines as usize],
            graph: Graph::new(),
        }
    }

    pub fn lines(&self) -> i32 {
        self.lines
    }

    pub fn cols(&self) -> i32 {
        self.cols
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn in_field(&self, pos: Position) -> bool {
        pos.0 >= 0 && pos.0 < self.lines && pos.1 >= 0 && pos.1 < self.cols
    }

    pub fn cell(&self, pos: Position) -> Cell {
        self.cells[pos.0 as usize][pos.1 as usize]
    }

    pub fn is_free(&self, pos: Position) -> bool {
        self.in_field(pos) && self.cell(pos) == Cell::Free
    }

    pub fn set_neuron(&mut self, pos: Position, kind: NeuronKind) {
        self.cells[pos.0 as usize][pos.1 as usize] = Cell::Neuron(kind);
    }

    pub fn set_resource(&mut self, pos: Position, kind: ResourceKind) {
        self.cells[pos.0 as usize][pos.1 as usize] = Cell::Resource(kind);
    }

    /// Clears a destroyed structure's cell back to walkable ground.
    pub fn clear_cell(&mut self, pos: Position) {
        self.cells[pos.0 as usize][pos.1 as usize] = Cell::Free;
    }

    fn clamp(&self, pos: Position) -> Position {
        (
            pos.0.clamp(0, self.lines - 1),
            pos.1.clamp(0, self.cols - 1),
        )
    }

    /// Scatters natural barriers: single rocks, heaps, and short vertical or
    /// horizontal ridges. Higher `denseness` places more of them.
    pub fn add_hills(&mut self, rng: &mut StdRng, denseness: i32) {
        let seeds = self.lines + self.lines * denseness.max(0) / 2;
        for _ in 0..seeds {
            let start = (
                rng.random_range(0..self.lines),
                rng.random_range(0..self.cols),
            );
            self.set_hill(start);
            match rng.random_range(0..4) {
                1 => {
                    // heap
                    for offset in [(1, 1), (0, 1), (-1, 0), (-1, -1)] {
                        self.set_hill((start.0 + offset.0, start.1 + offset.1));
                    }
                }
                2 => {
                    // vertical ridge
                    for dl in [-2, -1, 1, 2] {
                        self.set_hill((start.0 + dl, start.1));
                    }
                }
                3 => {
                    // horizontal ridge
                    for dc in [-2, -1, 1, 2] {
                        self.set_hill((start.0, start.1 + dc));
                    }
                }
                _ => {}
            }
        }
    }

    fn set_hill(&mut self, pos: Position) {
        let pos = self.clamp(pos);
        self.cells[pos.0 as usize][pos.1 as usize] = Cell::Hill;
    }

    fn section_bounds(&self, section: usize) -> (Position, Position) {
        // Sections tile the grid 4 across, 2 down.
        let height = self.lines / 2;
        let width = self.cols / 4;
        let row = (section / 4) as i32;
        let col = (section % 4) as i32;
        (
            (row * height, col * width),
            (row * height + height - 1, col * width + width - 1),
        )
    }

    /// Center cell of each of the eight sections.
    pub fn center_positions_of_sections(&self) -> Vec<Position> {
        (0..NUM_SECTIONS)
            .map(|s| {
                let (top_left, bottom_right) = self.section_bounds(s);
                (
                    (top_left.0 + bottom_right.0) / 2,
                    (top_left.1 + bottom_right.1) / 2,
                )
            })
            .collect()
    }

    /// Places a nucleus somewhere inside the given section.
    pub fn add_nucleus(&mut self, section: usize, music: &mut MusicRng) -> Option<Position> {
        let (top_left, bottom_right) = self.section_bounds(section % NUM_SECTIONS);
        let base = (
            music.next_in(top_left.0 + 1, bottom_right.0 - 1),
            music.next_in(top_left.1 + 1, bottom_right.1 - 1),
        );
        let pos = if self.is_free(base) {
            base
        } else {
            self.find_free(base, 1, 6)?
        };
        self.set_neuron(pos, NeuronKind::Nucleus);
        Some(pos)
    }

    /// Places the six placeable resources as a ring around a nucleus, with
    /// offsets drawn from the analysis note stream.
    pub fn add_resources(
        &mut self,
        near: Position,
        music: &mut MusicRng,
    ) -> BTreeMap<ResourceKind, Position> {
        let mut placed = BTreeMap::new();
        let ring = self.in_range(near, 4.0, 2.0, true);
        let offset = if ring.is_empty() {
            0
        } else {
            music.next_in(0, ring.len() as i32 - 1) as usize
        };
        for (i, kind) in ResourceKind::PLACEABLE.into_iter().enumerate() {
            let pos = if ring.is_empty() {
                self.find_free(near, 2, 6)
            } else {
                // Spread the six resources evenly over the ring, skipping
                // cells taken by an earlier resource.
                let spacing = ring.len().div_ceil(ResourceKind::PLACEABLE.len());
                (0..ring.len())
                    .map(|probe| ring[(offset + i * spacing + probe) % ring.len()])
                    .find(|&p| self.is_free(p))
            };
            let Some(pos) = pos else {
                log::warn!("FIELD: no free cell for resource {:?} near {:?}", kind, near);
                continue;
            };
            self.set_resource(pos, kind);
            placed.insert(kind, pos);
        }
        placed
    }

    /// Builds the walkability graph: one node per non-hill cell, edges to all
    /// eight neighbors, reduced to the largest connected component. Cells cut
    /// off by the reduction become hills. Fails if either endpoint drops out.
    pub fn build_graph(&mut self, pos_a: Position, pos_b: Position) -> Result<(), GameError> {
        let mut graph = Graph::new();
        for l in 0..self.lines {
            for c in 0..self.cols {
                if self.cell((l, c)) != Cell::Hill {
                    graph.add_node((l, c));
                }
            }
        }
        for l in 0..self.lines {
            for c in 0..self.cols {
                if self.cell((l, c)) == Cell::Hill {
                    continue;
                }
                // Forward neighbors only; edges are bidirectional.
                for (dl, dc) in [(0, 1), (1, -1), (1, 0), (1, 1)] {
                    let other = (l + dl, c + dc);
                    if self.in_field(other) && self.cell(other) != Cell::Hill {
                        graph.add_edge((l, c), other);
                    }
                }
            }
        }

        let removed = graph.reduce_to_largest_component();
        for pos in removed {
            if self.cell(pos) == Cell::Free {
                self.set_hill(pos);
            }
        }
        if !graph.contains(pos_a) || !graph.contains(pos_b) {
            return Err(GameError::UnreachableEndpoints);
        }
        self.graph = graph;
        Ok(())
    }

    /// Path from `start` through all way-points, ending at the last target.
    /// Intermediate stops are visited nearest-first to keep the total way
    /// short.
    pub fn find_way(
        &self,
        start: Position,
        targets: &[Position],
    ) -> Result<Vec<Position>, GameError> {
        let Some((&last, rest)) = targets.split_last() else {
            return Ok(vec![start]);
        };

        let mut remaining = rest.to_vec();
        let mut order = Vec::with_capacity(targets.len());
        let mut cur = start;
        while !remaining.is_empty() {
            let (idx, _) = remaining
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    util::dist(cur, **a)
                        .partial_cmp(&util::dist(cur, **b))
                        .expect("distances are finite")
                })
                .expect("remaining is non-empty");
            cur = remaining.remove(idx);
            order.push(cur);
        }
        order.push(last);

        let mut way = vec![start];
        let mut cur = start;
        for target in order {
            let leg = self.graph.find_way(cur, target)?;
            way.extend(leg.into_iter().skip(1));
            cur = target;
        }
        Ok(way)
    }

    /// All positions within the Euclidean annulus `[min_dist, max_dist]`
    /// around `start`, optionally restricted to free cells.
    pub fn in_range(
        &self,
        start: Position,
        max_dist: f64,
        min_dist: f64,
        require_free: bool,
    ) -> Vec<Position> {
        let radius = max_dist.ceil() as i32;
        let mut positions = Vec::new();
        for l in start.0 - radius..=start.0 + radius {
            for c in start.1 - radius..=start.1 + radius {
                let pos = (l, c);
                if !self.in_field(pos) || (require_free && !self.is_free(pos)) {
                    continue;
                }
                if util::in_range(start, pos, min_dist, max_dist) {
                    positions.push(pos);
                }
            }
        }
        positions
    }

    /// Nearest free cell within the annulus `[min, max]` around `center`,
    /// scanning ring by ring.
    pub fn find_free(&self, center: Position, min: i32, max: i32) -> Option<Position> {
        for r in min..=max {
            let lower = (r as f64 - 1.0).max(min as f64 - 0.5);
            for l in center.0 - r..=center.0 + r {
                for c in center.1 - r..=center.1 + r {
                    let pos = (l, c);
                    if !self.is_free(pos) {
                        continue;
                    }
                    let d = util::dist(center, pos);
                    if d > lower && d <= r as f64 {
                        return Some(pos);
                    }
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::analysis::{AnalyzedAudio, BeatPoint, Note};

    fn music() -> MusicRng {
        let beats = vec![BeatPoint {
            time_ms: 0.0,
            bpm: 120,
            level: 50,
            notes: vec![Note::from_midi(60), Note::from_midi(64), Note::from_midi(67)],
            interval_id: 0,
        }];
        MusicRng::new(&AnalyzedAudio::from_beats(beats))
    }

    #[test]
    fn test_build_graph_covers_open_field() {
        let mut field = Field::new(10, 10);
        field.build_graph((0, 0), (9, 9)).unwrap();
        assert_eq!(field.graph().len(), 100);
        let way = field.find_way((0, 0), &[(9, 9)]).unwrap();
        // Diagonal moves allowed: ten cells end to end.
        assert_eq!(way.len(), 10);
    }

    #[test]
    fn test_build_graph_wall_is_unreachable() {
        let mut field = Field::new(10, 10);
        for l in 0..10 {
            field.set_hill((l, 5));
        }
        assert_eq!(
            field.build_graph((0, 0), (9, 9)),
            Err(GameError::UnreachableEndpoints)
        );
    }

    #[test]
    fn test_build_graph_rewrites_cut_off_cells() {
        let mut field = Field::new(10, 10);
        // Fence off the top-left corner cell.
        field.set_hill((0, 1));
        field.set_hill((1, 0));
        field.set_hill((1, 1));
        field.build_graph((5, 5), (9, 9)).unwrap();
        assert_eq!(field.cell((0, 0)), Cell::Hill);
        assert!(!field.graph().contains((0, 0)));
    }

    #[test]
    fn test_find_way_to_self() {
        let mut field = Field::new(5, 5);
        field.build_graph((0, 0), (4, 4)).unwrap();
        assert_eq!(field.find_way((2, 2), &[(2, 2)]).unwrap(), vec![(2, 2)]);
    }

    #[test]
    fn test_find_way_visits_way_points_nearest_first() {
        let mut field = Field::new(5, 20);
        field.build_graph((0, 0), (4, 19)).unwrap();
        // Stops given far-first; the path should still visit (2,5) first.
        let way = field.find_way((2, 0), &[(2, 10), (2, 5), (2, 19)]).unwrap();
        let i5 = way.iter().position(|&p| p == (2, 5)).unwrap();
        let i10 = way.iter().position(|&p| p == (2, 10)).unwrap();
        assert!(i5 < i10);
        assert_eq!(way.last(), Some(&(2, 19)));
    }

    #[test]
    fn test_find_free_respects_annulus() {
        let mut field = Field::new(9, 9);
        let center = (4, 4);
        let found = field.find_free(center, 2, 4).unwrap();
        let d = util::dist(center, found);
        assert!(d >= 1.5 && d <= 4.0);
        // With the whole annulus filled, nothing is found.
        for pos in field.in_range(center, 4.0, 0.0, true) {
            field.set_hill(pos);
        }
        assert_eq!(field.find_free(center, 0, 4), None);
    }

    #[test]
    fn test_in_range_require_free() {
        let mut field = Field::new(9, 9);
        field.set_neuron((4, 5), NeuronKind::Synapse);
        let all = field.in_range((4, 4), 1.5, 1.0, false);
        let free = field.in_range((4, 4), 1.5, 1.0, true);
        assert!(all.contains(&(4, 5)));
        assert!(!free.contains(&(4, 5)));
        assert_eq!(all.len(), 8);
    }

    #[test]
    fn test_sections_cover_grid() {
        let field = Field::new(40, 80);
        let centers = field.center_positions_of_sections();
        assert_eq!(centers.len(), 8);
        for center in &centers {
            assert!(field.in_field(*center));
        }
        // All centers are distinct.
        let mut unique = centers.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 8);
    }

    #[test]
    fn test_add_nucleus_lands_in_section() {
        let mut field = Field::new(40, 80);
        let mut music = music();
        let pos = field.add_nucleus(3, &mut music).unwrap();
        assert!(field.in_field(pos));
        assert_eq!(field.cell(pos), Cell::Neuron(NeuronKind::Nucleus));
    }

    #[test]
    fn test_add_resources_places_all_six() {
        let mut field = Field::new(40, 80);
        let mut music = music();
        let nucleus = (20, 40);
        field.set_neuron(nucleus, NeuronKind::Nucleus);
        let placed = field.add_resources(nucleus, &mut music);
        assert_eq!(placed.len(), 6);
        for (kind, pos) in placed {
            assert_eq!(field.cell(pos), Cell::Resource(kind));
            assert!(util::in_range(nucleus, pos, 2.0, 4.0));
        }
    }
}
