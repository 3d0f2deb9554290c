// src/amr/indicator.rs
//
// Coarse-grid refinement indicators: turn a cell-centred scalar field into the
// integer tag array the clustering consumes.

use crate::amr::rect::IndexBox;

/// A scalar field over a 2-D cell box (first axis fastest).
#[derive(Clone, Debug)]
pub struct ScalarField2D {
    pub domain: IndexBox<2>,
    pub data: Vec<f64>,
}

impl ScalarField2D {
    pub fn from_fn(domain: IndexBox<2>, f: impl Fn([i32; 2]) -> f64) -> Self {
        let data = domain.cells().map(f).collect();
        Self { domain, data }
    }

    #[inline]
    pub fn at(&self, cell: [i32; 2]) -> f64 {
        self.data[self.domain.offset(cell)]
    }
}

#[derive(Clone, Copy, Debug)]
pub struct IndicatorStats {
    pub max: f64,
    pub threshold: f64,
    pub tagged: usize,
}

/// Squared forward-difference gradient magnitude, one-sided at the upper edges.
#[inline]
pub fn indicator_grad2_forward(field: &ScalarField2D, cell: [i32; 2]) -> f64 {
    let d = &field.domain;
    let v = field.at(cell);
    let ip = [(cell[0] + 1).min(d.upper[0]), cell[1]];
    let jp = [cell[0], (cell[1] + 1).min(d.upper[1])];
    let dx = field.at(ip) - v;
    let dy = field.at(jp) - v;
    dx * dx + dy * dy
}

/// Tag cells where indicator >= frac * max(indicator).
///
/// Returns the tag array (`tag_val` on flagged cells, 0 elsewhere) laid out over
/// `field.domain`. A flat field tags nothing.
pub fn tag_cells_from_indicator(
    field: &ScalarField2D,
    frac: f64,
    tag_val: i32,
) -> (Vec<i32>, IndicatorStats) {
    let ind: Vec<f64> = field
        .domain
        .cells()
        .map(|c| indicator_grad2_forward(field, c))
        .collect();
    let max_ind = ind.iter().copied().fold(0.0_f64, f64::max);

    let frac = frac.clamp(0.0, 1.0);
    let thresh = frac * max_ind;

    let tags: Vec<i32> = if max_ind > 0.0 {
        ind.iter()
            .map(|&v| if v >= thresh { tag_val } else { 0 })
            .collect()
    } else {
        vec![0; ind.len()]
    };
    let tagged = tags.iter().filter(|&&t| t == tag_val && t != 0).count();

    let stats = IndicatorStats {
        max: max_ind,
        threshold: thresh,
        tagged,
    };
    (tags, stats)
}
