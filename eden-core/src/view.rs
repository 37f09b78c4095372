//! View Manager — creates/destroys web-view surfaces, maintains bounds,
//! visibility, mode and z-order, and enforces the layering invariant
//! (spec §4.5, §8 property 1).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::OnceCell;
use serde_json::Value as JsonValue;

use crate::error::Error;
use crate::manifest::{Manifest, WindowMode};
use crate::tiling::{tile_rects, Rect, TilingConfig};

const OVERLAY_Z_MIN: u32 = 1000;
const OVERLAY_Z_MAX: u32 = 9999;
const APP_Z_MIN: u32 = 1;
const APP_Z_MAX: u32 = 999;
const FLOATING_CASCADE_OFFSET: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewType {
	App,
	Overlay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewMode {
	Floating,
	Tiled,
}

/// One rendered surface. `tile_index`/`z_index` are mutually exclusive
/// exactly as spec §3 requires: tiled views carry a tile index and no z,
/// floating views carry a z and no tile index.
#[derive(Debug, Clone)]
pub struct View {
	pub view_id: u32,
	pub app_id: String,
	pub bounds: Rect,
	pub visible: bool,
	pub view_type: ViewType,
	pub mode: ViewMode,
	pub tile_index: Option<usize>,
	pub z_index: Option<u32>,
}

impl View {
	fn assert_invariants(&self) {
		match self.mode {
			ViewMode::Tiled => {
				debug_assert!(self.tile_index.is_some());
				debug_assert!(self.z_index.is_none());
			}
			ViewMode::Floating => {
				debug_assert!(self.z_index.is_some());
			}
		}
		if self.view_type == ViewType::Overlay {
			debug_assert_eq!(self.mode, ViewMode::Floating);
			if let Some(z) = self.z_index {
				debug_assert!((OVERLAY_Z_MIN..=OVERLAY_Z_MAX).contains(&z));
			}
		}
	}
}

/// The external collaborator standing in for the embedded browser engine.
/// The View Manager only ever talks to a surface through this seam.
pub trait WebSurface: Send + Sync {
	fn apply_bounds(&self, bounds: Rect);
	fn apply_visible(&self, visible: bool);
	fn close_devtools(&self);
	fn toggle_devtools(&self);
	fn destroy(&self);
	fn post_message(&self, message: JsonValue);
}

/// Creates the concrete surface for a view (loads the frontend entry,
/// wires up the preload script, injects CSS). Implementing this is the
/// embedder's job; the kernel only needs the handle it returns.
pub trait SurfaceFactory: Send + Sync {
	fn create(&self, app_id: &str, manifest: &Manifest, install_path: &str, view_type: ViewType) -> Arc<dyn WebSurface>;
}

/// Write-once cache for the design-system CSS: read from disk at most
/// once per host lifetime (spec §4.5, §9 "global mutable state").
#[derive(Default)]
pub struct DesignSystemCssCache {
	cell: OnceCell<Arc<String>>,
}

impl DesignSystemCssCache {
	pub fn new() -> Self {
		DesignSystemCssCache { cell: OnceCell::new() }
	}

	pub fn get_or_load(&self, loader: impl FnOnce() -> std::io::Result<String>) -> std::io::Result<Arc<String>> {
		if let Some(css) = self.cell.get() {
			return Ok(css.clone());
		}
		let css = Arc::new(loader()?);
		// Another thread may have raced us; `set` failing just means we
		// discard our copy and use theirs.
		let _ = self.cell.set(css.clone());
		Ok(self.cell.get().expect("just set").clone())
	}

	/// Supports hot development: forces the next `get_or_load` to re-read.
	pub fn clear(&mut self) {
		self.cell = OnceCell::new();
	}
}

pub struct ViewManager {
	views: Mutex<Vec<View>>,
	surfaces: Mutex<HashMap<u32, Arc<dyn WebSurface>>>,
	next_view_id: Mutex<u32>,
	workspace: Mutex<Rect>,
	tiling: Mutex<TilingConfig>,
	focused_view: Mutex<Option<u32>>,
	factory: Arc<dyn SurfaceFactory>,
	pub css_cache: DesignSystemCssCache,
}

impl ViewManager {
	pub fn new(workspace: Rect, tiling: TilingConfig, factory: Arc<dyn SurfaceFactory>) -> Self {
		ViewManager {
			views: Mutex::new(Vec::new()),
			surfaces: Mutex::new(HashMap::new()),
			next_view_id: Mutex::new(1),
			workspace: Mutex::new(workspace),
			tiling: Mutex::new(tiling),
			focused_view: Mutex::new(None),
			factory,
			css_cache: DesignSystemCssCache::new(),
		}
	}

	fn alloc_view_id(&self) -> u32 {
		let mut next = self.next_view_id.lock().expect("next_view_id poisoned");
		let id = *next;
		*next += 1;
		id
	}

	/// `mode=both` is resolved by whether tiling is currently enabled;
	/// a missing window block behaves like `both` (spec §4.5 step 3).
	pub fn determine_view_mode(&self, manifest_mode: Option<WindowMode>) -> ViewMode {
		let tiling_enabled = self.tiling.lock().expect("tiling poisoned").enabled();
		match manifest_mode {
			None => if tiling_enabled { ViewMode::Tiled } else { ViewMode::Floating },
			Some(WindowMode::Floating) => ViewMode::Floating,
			Some(WindowMode::Tiled) => ViewMode::Tiled,
			Some(WindowMode::Both) => if tiling_enabled { ViewMode::Tiled } else { ViewMode::Floating },
		}
	}

	fn next_tile_index(views: &[View]) -> usize {
		views
			.iter()
			.filter(|v| v.mode == ViewMode::Tiled && v.view_type == ViewType::App)
			.filter_map(|v| v.tile_index)
			.max()
			.map(|m| m + 1)
			.unwrap_or(0)
	}

	fn next_floating_z(views: &[View], view_type: ViewType) -> u32 {
		let (min, max) = match view_type {
			ViewType::App => (APP_Z_MIN, APP_Z_MAX),
			ViewType::Overlay => (OVERLAY_Z_MIN, OVERLAY_Z_MAX),
		};
		views
			.iter()
			.filter(|v| v.view_type == view_type && v.z_index.is_some())
			.filter_map(|v| v.z_index)
			.max()
			.map(|m| (m + 1).min(max))
			.unwrap_or(min)
	}

	fn cascade_bounds(views: &[View], base: Rect, view_type: ViewType) -> Rect {
		let floating_count = views.iter().filter(|v| v.view_type == view_type && v.mode == ViewMode::Floating).count();
		let offset = FLOATING_CASCADE_OFFSET * floating_count as f64;
		Rect { x: base.x + offset, y: base.y + offset, w: base.w, h: base.h }
	}

	fn clamp(bounds: Rect, min: Option<crate::manifest::Size>, max: Option<crate::manifest::Size>) -> Rect {
		let mut out = bounds;
		if let Some(min) = min {
			out.w = out.w.max(min.width);
			out.h = out.h.max(min.height);
		}
		if let Some(max) = max {
			out.w = out.w.min(max.width);
			out.h = out.h.min(max.height);
		}
		out
	}

	fn default_floating_bounds(&self, manifest: &Manifest, views: &[View], view_type: ViewType) -> Rect {
		let workspace = *self.workspace.lock().expect("workspace poisoned");
		let window = manifest.window.as_ref();
		let size = window.and_then(|w| w.default_size).unwrap_or(crate::manifest::Size { width: 800.0, height: 600.0 });
		let position = window.and_then(|w| w.default_position);
		let base = match position {
			Some(p) => Rect { x: p.x, y: p.y, w: size.width, h: size.height },
			None => Rect {
				x: workspace.x + (workspace.w - size.width) / 2.0,
				y: workspace.y + (workspace.h - size.height) / 2.0,
				w: size.width,
				h: size.height,
			},
		};
		let cascaded = if position.is_none() { Self::cascade_bounds(views, base, view_type) } else { base };
		Self::clamp(cascaded, window.and_then(|w| w.min_size), window.and_then(|w| w.max_size))
	}

	/// Creates an app view: allocates a fresh id, decides mode, computes
	/// bounds, inserts into the ordered child list honoring the layering
	/// invariant. Returns the new `view_id`.
	pub fn create_app_view(&self, app_id: &str, manifest: &Manifest, install_path: &str, requested_bounds: Option<Rect>) -> u32 {
		let view_id = self.alloc_view_id();
		let surface = self.factory.create(app_id, manifest, install_path, ViewType::App);

		let mode = self.determine_view_mode(manifest.window.as_ref().and_then(|w| w.mode));
		let mut views = self.views.lock().expect("views poisoned");

		let (bounds, tile_index, z_index) = match mode {
			ViewMode::Tiled => {
				let index = Self::next_tile_index(&views);
				let workspace = *self.workspace.lock().expect("workspace poisoned");
				let tiling = *self.tiling.lock().expect("tiling poisoned");
				let visible_count = views.iter().filter(|v| v.mode == ViewMode::Tiled && v.view_type == ViewType::App && v.visible).count() + 1;
				let rect = tile_rects(workspace, &tiling, visible_count).get(index).copied().unwrap_or(workspace);
				(rect, Some(index), None)
			}
			ViewMode::Floating => {
				let bounds = requested_bounds.unwrap_or_else(|| self.default_floating_bounds(manifest, &views, ViewType::App));
				let z = Self::next_floating_z(&views, ViewType::App);
				(bounds, None, Some(z))
			}
		};

		let view = View { view_id, app_id: app_id.to_string(), bounds, visible: true, view_type: ViewType::App, mode, tile_index, z_index };
		view.assert_invariants();
		surface.apply_bounds(view.bounds);
		surface.apply_visible(true);
		views.push(view);

		self.surfaces.lock().expect("surfaces poisoned").insert(view_id, surface);
		if tile_index.is_some() {
			Self::recompute_tiles_locked(&mut views, *self.workspace.lock().expect("workspace poisoned"), *self.tiling.lock().expect("tiling poisoned"), &self.surfaces.lock().expect("surfaces poisoned"));
		}
		drop(views);
		self.reorder();
		view_id
	}

	/// Overlays are always floating, always in the privileged z range.
	pub fn create_overlay_view(&self, app_id: &str, manifest: &Manifest, install_path: &str, bounds: Rect) -> u32 {
		let view_id = self.alloc_view_id();
		let surface = self.factory.create(app_id, manifest, install_path, ViewType::Overlay);

		let mut views = self.views.lock().expect("views poisoned");
		let z = Self::next_floating_z(&views, ViewType::Overlay);
		let view = View { view_id, app_id: app_id.to_string(), bounds, visible: true, view_type: ViewType::Overlay, mode: ViewMode::Floating, tile_index: None, z_index: Some(z) };
		view.assert_invariants();
		surface.apply_bounds(bounds);
		surface.apply_visible(true);
		views.push(view);
		drop(views);
		self.surfaces.lock().expect("surfaces poisoned").insert(view_id, surface);
		self.reorder();
		view_id
	}

	/// Removes a view. Must succeed even if the surface is already
	/// destroyed (spec §4.5 "Removal").
	pub fn destroy_view(&self, view_id: u32) {
		if let Some(focused) = *self.focused_view.lock().expect("focused poisoned") {
			if focused == view_id {
				*self.focused_view.lock().expect("focused poisoned") = None;
			}
		}
		if let Some(surface) = self.surfaces.lock().expect("surfaces poisoned").remove(&view_id) {
			surface.close_devtools();
			surface.destroy();
		}

		let mut views = self.views.lock().expect("views poisoned");
		let was_tiled = views.iter().find(|v| v.view_id == view_id).map(|v| v.mode == ViewMode::Tiled).unwrap_or(false);
		views.retain(|v| v.view_id != view_id);
		if was_tiled {
			let workspace = *self.workspace.lock().expect("workspace poisoned");
			let tiling = *self.tiling.lock().expect("tiling poisoned");
			Self::recompute_tiles_locked(&mut views, workspace, tiling, &self.surfaces.lock().expect("surfaces poisoned"));
		}
		drop(views);
		self.reorder();
	}

	/// Tiled app views ignore bounds updates (a function of the tiling
	/// engine); overlays accept unchecked; floating app views are clamped
	/// to the manifest's min/max; hidden views store but don't apply.
	pub fn set_bounds(&self, view_id: u32, bounds: Rect, manifest: Option<&Manifest>) -> Result<(), Error> {
		let mut views = self.views.lock().expect("views poisoned");
		let view = views.iter_mut().find(|v| v.view_id == view_id).ok_or_else(|| Error::not_found(format!("view {view_id}")))?;
		if view.mode == ViewMode::Tiled && view.view_type == ViewType::App {
			return Ok(());
		}
		let bounds = if view.view_type == ViewType::App {
			let window = manifest.and_then(|m| m.window.as_ref());
			Self::clamp(bounds, window.and_then(|w| w.min_size), window.and_then(|w| w.max_size))
		} else {
			bounds
		};
		view.bounds = bounds;
		if view.visible {
			if let Some(surface) = self.surfaces.lock().expect("surfaces poisoned").get(&view_id) {
				surface.apply_bounds(bounds);
			}
		}
		Ok(())
	}

	pub fn show(&self, view_id: u32) -> Result<(), Error> {
		let mut views = self.views.lock().expect("views poisoned");
		{
			let view = views.iter_mut().find(|v| v.view_id == view_id).ok_or_else(|| Error::not_found(format!("view {view_id}")))?;
			view.visible = true;
		}
		if views.iter().any(|v| v.view_id == view_id && v.mode == ViewMode::Tiled) {
			let workspace = *self.workspace.lock().expect("workspace poisoned");
			let tiling = *self.tiling.lock().expect("tiling poisoned");
			Self::recompute_tiles_locked(&mut views, workspace, tiling, &self.surfaces.lock().expect("surfaces poisoned"));
		}
		let bounds = views.iter().find(|v| v.view_id == view_id).map(|v| v.bounds);
		drop(views);
		if let (Some(bounds), Some(surface)) = (bounds, self.surfaces.lock().expect("surfaces poisoned").get(&view_id)) {
			surface.apply_bounds(bounds);
			surface.apply_visible(true);
		}
		self.reorder();
		Ok(())
	}

	pub fn hide(&self, view_id: u32) -> Result<(), Error> {
		let mut views = self.views.lock().expect("views poisoned");
		let was_tiled = {
			let view = views.iter_mut().find(|v| v.view_id == view_id).ok_or_else(|| Error::not_found(format!("view {view_id}")))?;
			view.visible = false;
			view.mode == ViewMode::Tiled
		};
		if was_tiled {
			let workspace = *self.workspace.lock().expect("workspace poisoned");
			let tiling = *self.tiling.lock().expect("tiling poisoned");
			Self::recompute_tiles_locked(&mut views, workspace, tiling, &self.surfaces.lock().expect("surfaces poisoned"));
		}
		drop(views);
		if let Some(surface) = self.surfaces.lock().expect("surfaces poisoned").get(&view_id) {
			surface.apply_bounds(Rect { x: 0.0, y: 0.0, w: 0.0, h: 0.0 });
			surface.apply_visible(false);
		}
		Ok(())
	}

	/// Recomputes tile indices/bounds for every visible tiled app view so
	/// indices stay a dense `[0..k)` ordered by prior tile index, then
	/// re-applies each surface's bounds. Must be called with `views`
	/// already locked by the caller.
	fn recompute_tiles_locked(views: &mut [View], workspace: Rect, tiling: TilingConfig, surfaces: &HashMap<u32, Arc<dyn WebSurface>>) {
		let mut indices: Vec<usize> = views
			.iter()
			.enumerate()
			.filter(|(_, v)| v.mode == ViewMode::Tiled && v.view_type == ViewType::App && v.visible)
			.map(|(i, _)| i)
			.collect();
		indices.sort_by_key(|&i| views[i].tile_index.unwrap_or(usize::MAX));

		let visible_count = indices.len();
		let rects = tile_rects(workspace, &tiling, visible_count);
		for (new_index, &i) in indices.iter().enumerate() {
			views[i].tile_index = Some(new_index);
			views[i].bounds = rects[new_index];
			if let Some(surface) = surfaces.get(&views[i].view_id) {
				surface.apply_bounds(views[i].bounds);
			}
		}
	}

	/// Toggles mode when `target` is omitted. Rejects if the manifest
	/// restricts the view to the opposite mode.
	pub fn set_view_mode(&self, view_id: u32, target: Option<ViewMode>, manifest: &Manifest) -> Result<(), Error> {
		if let Some(window) = manifest.window.as_ref() {
			match window.mode {
				Some(WindowMode::Floating) if target == Some(ViewMode::Tiled) => {
					return Err(Error::Conflict(format!("{} only supports floating mode", manifest.id)));
				}
				Some(WindowMode::Tiled) if target == Some(ViewMode::Floating) => {
					return Err(Error::Conflict(format!("{} only supports tiled mode", manifest.id)));
				}
				_ => {}
			}
		}

		let mut views = self.views.lock().expect("views poisoned");
		let current_mode = views.iter().find(|v| v.view_id == view_id).map(|v| v.mode).ok_or_else(|| Error::not_found(format!("view {view_id}")))?;
		let new_mode = target.unwrap_or(match current_mode {
			ViewMode::Tiled => ViewMode::Floating,
			ViewMode::Floating => ViewMode::Tiled,
		});
		if new_mode == current_mode {
			return Ok(());
		}

		match new_mode {
			ViewMode::Floating => {
				let z = Self::next_floating_z(&views, ViewType::App);
				let bounds = self.default_floating_bounds(manifest, &views, ViewType::App);
				let view = views.iter_mut().find(|v| v.view_id == view_id).expect("checked above");
				view.tile_index = None;
				view.z_index = Some(z);
				view.mode = ViewMode::Floating;
				view.bounds = bounds;
				let workspace = *self.workspace.lock().expect("workspace poisoned");
				let tiling = *self.tiling.lock().expect("tiling poisoned");
				Self::recompute_tiles_locked(&mut views, workspace, tiling, &self.surfaces.lock().expect("surfaces poisoned"));
			}
			ViewMode::Tiled => {
				let index = Self::next_tile_index(&views);
				let view = views.iter_mut().find(|v| v.view_id == view_id).expect("checked above");
				view.z_index = None;
				view.tile_index = Some(index);
				view.mode = ViewMode::Tiled;
				let workspace = *self.workspace.lock().expect("workspace poisoned");
				let tiling = *self.tiling.lock().expect("tiling poisoned");
				Self::recompute_tiles_locked(&mut views, workspace, tiling, &self.surfaces.lock().expect("surfaces poisoned"));
			}
		}

		let bounds = views.iter().find(|v| v.view_id == view_id).map(|v| v.bounds);
		drop(views);
		if let (Some(bounds), Some(surface)) = (bounds, self.surfaces.lock().expect("surfaces poisoned").get(&view_id)) {
			surface.apply_bounds(bounds);
			surface.post_message(serde_json::json!({"type": "view-mode-changed", "mode": if new_mode == ViewMode::Floating { "floating" } else { "tiled" }}));
		}
		self.reorder();
		Ok(())
	}

	/// Assigns `max(z)+1` among floating views of the same type.
	pub fn bring_to_front(&self, view_id: u32) -> Result<(), Error> {
		let mut views = self.views.lock().expect("views poisoned");
		let view_type = views.iter().find(|v| v.view_id == view_id).map(|v| v.view_type).ok_or_else(|| Error::not_found(format!("view {view_id}")))?;
		let new_z = Self::next_floating_z(&views, view_type);
		let view = views.iter_mut().find(|v| v.view_id == view_id).expect("checked above");
		if view.mode != ViewMode::Floating {
			return Err(Error::Conflict("cannot reorder a tiled view's z-index".into()));
		}
		view.z_index = Some(new_z);
		drop(views);
		self.reorder();
		Ok(())
	}

	pub fn send_to_back(&self, view_id: u32) -> Result<(), Error> {
		let mut views = self.views.lock().expect("views poisoned");
		let view_type = views.iter().find(|v| v.view_id == view_id).map(|v| v.view_type).ok_or_else(|| Error::not_found(format!("view {view_id}")))?;
		let min_z = match view_type {
			ViewType::App => APP_Z_MIN,
			ViewType::Overlay => OVERLAY_Z_MIN,
		};
		// Shift every other floating view of the same type up by one to
		// make room at the bottom, then park this one at the floor.
		for v in views.iter_mut() {
			if v.view_type == view_type && v.mode == ViewMode::Floating && v.view_id != view_id {
				if let Some(z) = v.z_index {
					v.z_index = Some(z + 1);
				}
			}
		}
		let view = views.iter_mut().find(|v| v.view_id == view_id).expect("checked above");
		view.z_index = Some(min_z);
		drop(views);
		self.reorder();
		Ok(())
	}

	pub fn set_focus(&self, view_id: Option<u32>) {
		*self.focused_view.lock().expect("focused poisoned") = view_id;
	}

	/// The `Ctrl/Cmd+Shift+D` shortcut: toggles devtools on whichever
	/// view currently has keyboard focus.
	pub fn toggle_devtools_for_focused(&self) {
		if let Some(view_id) = *self.focused_view.lock().expect("focused poisoned") {
			if let Some(surface) = self.surfaces.lock().expect("surfaces poisoned").get(&view_id) {
				surface.toggle_devtools();
			}
		}
	}

	pub fn set_workspace_bounds(&self, workspace: Rect) {
		*self.workspace.lock().expect("workspace poisoned") = workspace;
		let mut views = self.views.lock().expect("views poisoned");
		let tiling = *self.tiling.lock().expect("tiling poisoned");
		Self::recompute_tiles_locked(&mut views, workspace, tiling, &self.surfaces.lock().expect("surfaces poisoned"));
	}

	pub fn set_tiling_config(&self, tiling: TilingConfig) {
		*self.tiling.lock().expect("tiling poisoned") = tiling;
		let workspace = *self.workspace.lock().expect("workspace poisoned");
		let mut views = self.views.lock().expect("views poisoned");
		Self::recompute_tiles_locked(&mut views, workspace, tiling, &self.surfaces.lock().expect("surfaces poisoned"));
	}

	/// The canonical host child list, bottom to top (spec §8 property 1):
	/// `tiled_app sorted by tile_index ++ floating_app sorted by z_index
	/// ++ overlay sorted by z_index`.
	pub fn canonical_order(&self) -> Vec<u32> {
		let views = self.views.lock().expect("views poisoned");
		Self::canonical_order_of(&views)
	}

	fn canonical_order_of(views: &[View]) -> Vec<u32> {
		let mut tiled: Vec<&View> = views.iter().filter(|v| v.mode == ViewMode::Tiled && v.view_type == ViewType::App).collect();
		tiled.sort_by_key(|v| v.tile_index.unwrap_or(usize::MAX));

		let mut floating_app: Vec<&View> = views.iter().filter(|v| v.mode == ViewMode::Floating && v.view_type == ViewType::App).collect();
		floating_app.sort_by_key(|v| v.z_index.unwrap_or(0));

		let mut overlay: Vec<&View> = views.iter().filter(|v| v.view_type == ViewType::Overlay).collect();
		overlay.sort_by_key(|v| v.z_index.unwrap_or(0));

		tiled.into_iter().chain(floating_app).chain(overlay).map(|v| v.view_id).collect()
	}

	/// A full reorder pass: recomputes and re-asserts the canonical order.
	/// The actual "remove and re-add children" step against the host
	/// window is the embedder's job (through `WebSurface`); the kernel's
	/// half of the invariant is just keeping this order queryable and
	/// consistent.
	fn reorder(&self) {
		let views = self.views.lock().expect("views poisoned");
		for v in views.iter() {
			v.assert_invariants();
		}
	}

	pub fn view(&self, view_id: u32) -> Option<View> {
		self.views.lock().expect("views poisoned").iter().find(|v| v.view_id == view_id).cloned()
	}

	pub fn views_for_app(&self, app_id: &str) -> Vec<View> {
		self.views.lock().expect("views poisoned").iter().filter(|v| v.app_id == app_id).cloned().collect()
	}

	pub fn tile_indices_are_dense(&self) -> bool {
		let views = self.views.lock().expect("views poisoned");
		let mut indices: Vec<usize> = views
			.iter()
			.filter(|v| v.mode == ViewMode::Tiled && v.view_type == ViewType::App && v.visible)
			.filter_map(|v| v.tile_index)
			.collect();
		indices.sort_unstable();
		indices.iter().enumerate().all(|(expected, &got)| expected == got)
	}
}
