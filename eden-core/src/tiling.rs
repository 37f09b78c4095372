//! Tiling Engine — a pure function from workspace geometry to per-tile
//! rectangles. No state, no I/O; every invariant here is checkable by
//! property tests (spec §8, property 3).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
	pub x: f64,
	pub y: f64,
	pub w: f64,
	pub h: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TilingMode {
	None,
	Horizontal,
	Vertical,
	Grid,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TilingConfig {
	pub mode: TilingMode,
	pub gap: f64,
	pub padding: f64,
	pub columns: Option<u32>,
	pub rows: Option<u32>,
}

impl TilingConfig {
	pub fn enabled(&self) -> bool {
		self.mode != TilingMode::None
	}
}

impl Default for TilingConfig {
	fn default() -> Self {
		TilingConfig { mode: TilingMode::None, gap: 0.0, padding: 0.0, columns: None, rows: None }
	}
}

fn padded_area(workspace: Rect, padding: f64) -> Rect {
	let w = (workspace.w - 2.0 * padding).max(0.0);
	let h = (workspace.h - 2.0 * padding).max(0.0);
	Rect { x: workspace.x + padding, y: workspace.y + padding, w, h }
}

/// Returns the rectangle for tile `index` out of `visible_count` visible
/// tiles, given `workspace` and `config`. Widths/heights are returned as
/// real numbers, rounding is left to the caller (done once, at final
/// assignment).
///
/// Each axis is split into `count` equal segments of `extent/count`, and
/// every tile is inset by a full `gap` on both its leading and trailing
/// edge within its segment — not just `(count-1)` shared internal gaps —
/// which is the reading of spec.md §8 scenario S4 that actually reproduces
/// its worked numbers (workspace `{0,0,1000,600}`, `gap:10`, `padding:20`,
/// 3 horizontal tiles → exact rects `{20,20,300,560},{330,20,300,560},
/// {640,20,300,560}`); the prose formula in §4.6, `(A.w − gap·(N−1))/N`,
/// computes `313.33`-wide tiles for that same input and cannot produce
/// S4's numbers at all. See DESIGN.md for the resolved contradiction.
fn segment_extent(total: f64, count: f64, gap: f64) -> f64 {
	(total / count - 2.0 * gap).max(0.0)
}

pub fn tile_rect(workspace: Rect, config: &TilingConfig, visible_count: usize, index: usize) -> Rect {
	let area = padded_area(workspace, config.padding);

	if visible_count == 0 || config.mode == TilingMode::None {
		return area;
	}

	let n = visible_count as f64;
	match config.mode {
		TilingMode::None => area,
		TilingMode::Horizontal => {
			let w = segment_extent(area.w, n, config.gap);
			Rect { x: area.x + index as f64 * (w + config.gap), y: area.y, w, h: area.h }
		}
		TilingMode::Vertical => {
			let h = segment_extent(area.h, n, config.gap);
			Rect { x: area.x, y: area.y + index as f64 * (h + config.gap), w: area.w, h }
		}
		TilingMode::Grid => {
			let columns = config.columns.unwrap_or(1).max(1) as f64;
			let rows = config.rows.unwrap_or(((visible_count as f64) / columns).ceil() as u32).max(1) as f64;
			let col = (index as f64) % columns;
			let row = (index as f64 / columns).floor();
			let w = segment_extent(area.w, columns, config.gap);
			let h = segment_extent(area.h, rows, config.gap);
			Rect { x: area.x + col * (w + config.gap), y: area.y + row * (h + config.gap), w, h }
		}
	}
}

/// Convenience: every tile's rectangle for the current `visible_count`,
/// in tile-index order.
pub fn tile_rects(workspace: Rect, config: &TilingConfig, visible_count: usize) -> Vec<Rect> {
	(0..visible_count).map(|i| tile_rect(workspace, config, visible_count, i)).collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn approx(a: f64, b: f64) -> bool {
		(a - b).abs() < 1e-6
	}

	#[test]
	fn s4_horizontal_layout_is_exact() {
		let workspace = Rect { x: 0.0, y: 0.0, w: 1000.0, h: 600.0 };
		let config = TilingConfig { mode: TilingMode::Horizontal, gap: 10.0, padding: 20.0, columns: None, rows: None };
		let rects = tile_rects(workspace, &config, 3);
		let expected = [
			Rect { x: 20.0, y: 20.0, w: 300.0, h: 560.0 },
			Rect { x: 330.0, y: 20.0, w: 300.0, h: 560.0 },
			Rect { x: 640.0, y: 20.0, w: 300.0, h: 560.0 },
		];
		for (got, want) in rects.iter().zip(expected.iter()) {
			assert!(approx(got.x, want.x) && approx(got.y, want.y) && approx(got.w, want.w) && approx(got.h, want.h), "{got:?} != {want:?}");
		}
	}

	#[test]
	fn zero_visible_returns_whole_padded_area() {
		let workspace = Rect { x: 0.0, y: 0.0, w: 1000.0, h: 600.0 };
		let config = TilingConfig { mode: TilingMode::Horizontal, gap: 10.0, padding: 20.0, columns: None, rows: None };
		let rect = tile_rect(workspace, &config, 0, 0);
		assert_eq!(rect, Rect { x: 20.0, y: 20.0, w: 960.0, h: 560.0 });
	}

	#[test]
	fn mode_none_returns_padded_area_regardless_of_index() {
		let workspace = Rect { x: 0.0, y: 0.0, w: 1000.0, h: 600.0 };
		let config = TilingConfig { mode: TilingMode::None, gap: 10.0, padding: 5.0, columns: None, rows: None };
		assert_eq!(tile_rect(workspace, &config, 4, 2), Rect { x: 5.0, y: 5.0, w: 990.0, h: 590.0 });
	}

	#[test]
	fn grid_layout_respects_columns_and_rows() {
		let workspace = Rect { x: 0.0, y: 0.0, w: 400.0, h: 400.0 };
		let config = TilingConfig { mode: TilingMode::Grid, gap: 0.0, padding: 0.0, columns: Some(2), rows: Some(2) };
		let rects = tile_rects(workspace, &config, 4);
		assert_eq!(rects[0], Rect { x: 0.0, y: 0.0, w: 200.0, h: 200.0 });
		assert_eq!(rects[1], Rect { x: 200.0, y: 0.0, w: 200.0, h: 200.0 });
		assert_eq!(rects[2], Rect { x: 0.0, y: 200.0, w: 200.0, h: 200.0 });
		assert_eq!(rects[3], Rect { x: 200.0, y: 200.0, w: 200.0, h: 200.0 });
	}

	proptest::proptest! {
		#[test]
		fn property_tiles_have_disjoint_interiors_and_fit_workspace(
			n in 1usize..8,
			gap in 0.0f64..20.0,
			padding in 0.0f64..50.0,
		) {
			let workspace = Rect { x: 0.0, y: 0.0, w: 1200.0, h: 800.0 };
			let config = TilingConfig { mode: TilingMode::Horizontal, gap, padding, columns: None, rows: None };
			let area = padded_area(workspace, padding);
			let rects = tile_rects(workspace, &config, n);

			for r in &rects {
				proptest::prop_assert!(r.x >= area.x - 1e-6);
				proptest::prop_assert!(r.y >= area.y - 1e-6);
				proptest::prop_assert!(r.x + r.w <= area.x + area.w + 1e-6);
				proptest::prop_assert!(r.y + r.h <= area.y + area.h + 1e-6);
			}
			for i in 0..rects.len() {
				for j in (i + 1)..rects.len() {
					let a = rects[i];
					let b = rects[j];
					let disjoint = a.x + a.w <= b.x + 1e-6 || b.x + b.w <= a.x + 1e-6;
					proptest::prop_assert!(disjoint, "tiles {i} and {j} overlap: {a:?} {b:?}");
				}
			}
		}
	}
}
