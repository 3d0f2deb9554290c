// src/visualisation.rs

use crate::amr::box_level::LevelBox;
use crate::amr::rect::IndexBox;
use plotters::prelude::*;

/// Distinct outline colour per owning rank.
fn owner_color(owner: usize) -> RGBColor {
    const PALETTE: [RGBColor; 8] = [
        RGBColor(214, 39, 40),
        RGBColor(31, 119, 180),
        RGBColor(44, 160, 44),
        RGBColor(255, 127, 14),
        RGBColor(148, 103, 189),
        RGBColor(140, 86, 75),
        RGBColor(227, 119, 194),
        RGBColor(23, 190, 207),
    ];
    PALETTE[owner % PALETTE.len()]
}

/// Save the tag field and the clustered boxes as a PNG.
/// - grey cells are tagged
/// - each box is outlined in the colour of its owning rank
pub fn save_cluster_plot(
    domain: &IndexBox<2>,
    tags: &[i32],
    tag_val: i32,
    boxes: &[LevelBox<2>],
    filename: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let (x0, y0) = (domain.lower[0], domain.lower[1]);
    let (x1, y1) = (domain.upper[0] + 1, domain.upper[1] + 1);

    let root = BitMapBackend::new(filename, (800, 800)).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .margin(40)
        .caption(
            format!("{} boxes (outline colour = owner rank)", boxes.len()),
            ("sans-serif", 20),
        )
        .x_label_area_size(40)
        .y_label_area_size(40)
        .build_cartesian_2d(x0..x1, y0..y1)?;

    chart
        .configure_mesh()
        .x_desc("i (cell index)")
        .y_desc("j (cell index)")
        .axis_desc_style(("sans-serif", 15))
        .draw()?;

    // One filled rectangle per tagged cell
    chart.draw_series(
        domain
            .cells()
            .filter(|&c| tags[domain.offset(c)] == tag_val)
            .map(|c| {
                Rectangle::new(
                    [(c[0], c[1]), (c[0] + 1, c[1] + 1)],
                    RGBColor(120, 120, 120).filled(),
                )
            }),
    )?;

    chart.draw_series(boxes.iter().map(|b| {
        let bx = &b.cell_box;
        Rectangle::new(
            [
                (bx.lower[0], bx.lower[1]),
                (bx.upper[0] + 1, bx.upper[1] + 1),
            ],
            owner_color(b.id.owner).stroke_width(2),
        )
    }))?;

    Ok(())
}
