//! Capture session lifecycle.
//!
//! One `CaptureContext` per open capture. It owns the replay device
//! context, the post-transform store, and the interop event map, and wires
//! event selection from any source (UI, interop socket) to every registered
//! listener. Closing the capture releases GPU buffers through the fetcher
//! and clears every per-capture table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use prism_annotate::ShaderStage;
use prism_interop::EventMap;
use prism_replay::context::{DeviceContext, DeviceLostHook};
use prism_replay::executor::StageData;
use prism_replay::store::{PostTransformStore, StageFetcher, StoreKey};
use tracing::{info, warn};

type SelectionListener = Box<dyn Fn(u64) + Send>;

pub struct CaptureContext {
    device: Option<DeviceContext>,
    device_lost: Arc<AtomicBool>,
    store: PostTransformStore,
    events: EventMap,
    selected_event: Option<u64>,
    selection_listeners: Vec<SelectionListener>,
    renames: HashMap<u64, String>,
    bookmarks: Vec<u64>,
    notes: HashMap<String, String>,
    loaded: bool,
}

impl Default for CaptureContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureContext {
    pub fn new() -> CaptureContext {
        CaptureContext {
            device: None,
            device_lost: Arc::new(AtomicBool::new(false)),
            store: PostTransformStore::new(),
            events: EventMap::new(),
            selected_event: None,
            selection_listeners: Vec::new(),
            renames: HashMap::new(),
            bookmarks: Vec::new(),
            notes: HashMap::new(),
            loaded: false,
        }
    }

    /// Hook to install on the replay device so device loss reaches the
    /// session. Once it fires, [`is_device_lost`](Self::is_device_lost)
    /// stays true and no further GPU work should be issued.
    pub fn device_lost_hook(&self) -> DeviceLostHook {
        let flag = Arc::clone(&self.device_lost);
        Arc::new(move |what: &str| {
            warn!(what, "session marked device-lost");
            flag.store(true, Ordering::SeqCst);
        })
    }

    pub fn is_device_lost(&self) -> bool {
        self.device_lost.load(Ordering::SeqCst)
    }

    pub fn attach_device(&mut self, device: DeviceContext) {
        self.device = Some(device);
    }

    pub fn device(&self) -> Option<&DeviceContext> {
        self.device.as_ref()
    }

    /// Loads a capture's event walk: (event id, display name) in linear
    /// order. Replaces any previously loaded capture's tables.
    pub fn load_capture<I>(&mut self, events: I)
    where
        I: IntoIterator<Item = (u64, String)>,
    {
        self.events.rebuild(events);
        self.selected_event = None;
        self.loaded = true;
        info!(events = self.events.len(), "capture loaded");
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn event_map(&self) -> &EventMap {
        &self.events
    }

    /// Registers an alias between two events that produce identical GPU
    /// state, so the store serves both from one fetch.
    pub fn register_event_alias(&mut self, primary_event_id: u64, alias_event_id: u64) {
        self.store.register_alias(primary_event_id, alias_event_id);
    }

    /// Cached (or freshly fetched) post-transform output for one event and
    /// stage.
    pub fn stage_output<'a, F: StageFetcher>(
        &'a mut self,
        fetcher: &mut F,
        event_id: u64,
        stage: ShaderStage,
    ) -> &'a StageData {
        self.store.get(fetcher, StoreKey { event_id, stage })
    }

    // Event selection.

    pub fn selected_event(&self) -> Option<u64> {
        self.selected_event
    }

    /// Selects an event by capture event id and notifies every listener.
    pub fn select_event(&mut self, event_id: u64) {
        self.selected_event = Some(event_id);
        for listener in &self.selection_listeners {
            listener(event_id);
        }
    }

    /// Selects by the interop tool's linear id; unknown ids are ignored
    /// with a warning rather than failing the connection.
    pub fn select_linear(&mut self, linear_id: u32) {
        match self.events.event_for_linear(linear_id) {
            Some(event_id) => self.select_event(event_id),
            None => warn!(linear_id, "interop selected an unknown linear id"),
        }
    }

    pub fn on_event_selected(&mut self, listener: impl Fn(u64) + Send + 'static) {
        self.selection_listeners.push(Box::new(listener));
    }

    // Per-capture annotation tables. Serialization into the capture
    // container is the container's job; these are the live in-memory side.

    pub fn rename_resource(&mut self, resource_id: u64, name: impl Into<String>) {
        self.renames.insert(resource_id, name.into());
    }

    pub fn resource_name(&self, resource_id: u64) -> Option<&str> {
        self.renames.get(&resource_id).map(String::as_str)
    }

    pub fn toggle_bookmark(&mut self, event_id: u64) {
        if let Some(at) = self.bookmarks.iter().position(|&e| e == event_id) {
            self.bookmarks.remove(at);
        } else {
            self.bookmarks.push(event_id);
        }
    }

    pub fn bookmarks(&self) -> &[u64] {
        &self.bookmarks
    }

    pub fn set_note(&mut self, key: impl Into<String>, text: impl Into<String>) {
        self.notes.insert(key.into(), text.into());
    }

    pub fn note(&self, key: &str) -> Option<&str> {
        self.notes.get(key).map(String::as_str)
    }

    /// Closes the capture: releases every cached GPU buffer through the
    /// fetcher, clears the per-capture tables, and destroys the device.
    pub fn close<F: StageFetcher>(&mut self, fetcher: &mut F) {
        self.store.invalidate(fetcher);
        self.events.clear();
        self.selected_event = None;
        self.renames.clear();
        self.bookmarks.clear();
        self.notes.clear();
        self.loaded = false;
        if let Some(device) = self.device.take() {
            device.destroy();
        }
        info!("capture closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    use prism_replay::driver::BufferHandle;

    struct StubFetcher {
        fetches: u32,
        released: Vec<BufferHandle>,
    }

    impl StubFetcher {
        fn new() -> StubFetcher {
            StubFetcher {
                fetches: 0,
                released: Vec::new(),
            }
        }
    }

    impl StageFetcher for StubFetcher {
        fn fetch(&mut self, _key: StoreKey) -> StageData {
            self.fetches += 1;
            StageData {
                vertex_buffer: Some(BufferHandle(u64::from(self.fetches))),
                index_buffer: None,
                vertex_stride: 16,
                vertex_count: 3,
                instance_count: 1,
                base_vertex: 0,
                near_plane: 0.1,
                far_plane: 100.0,
                flip_y: true,
                status: String::new(),
            }
        }

        fn release(&mut self, buffer: BufferHandle) {
            self.released.push(buffer);
        }
    }

    fn loaded_context() -> CaptureContext {
        let mut ctx = CaptureContext::new();
        ctx.load_capture([
            (100, "Clear".to_owned()),
            (250, "Draw".to_owned()),
        ]);
        ctx
    }

    #[test]
    fn selection_propagates_to_listeners() {
        let mut ctx = loaded_context();
        let (tx, rx) = mpsc::channel();
        ctx.on_event_selected(move |event_id| {
            let _ = tx.send(event_id);
        });

        ctx.select_event(250);
        assert_eq!(rx.try_recv(), Ok(250));
        assert_eq!(ctx.selected_event(), Some(250));
    }

    #[test]
    fn linear_selection_translates_through_the_event_map() {
        let mut ctx = loaded_context();
        ctx.select_linear(1);
        assert_eq!(ctx.selected_event(), Some(250));

        // Unknown linear ids leave the selection untouched.
        ctx.select_linear(99);
        assert_eq!(ctx.selected_event(), Some(250));
    }

    #[test]
    fn stage_output_is_served_from_the_store() {
        let mut ctx = loaded_context();
        let mut fetcher = StubFetcher::new();

        let first = ctx
            .stage_output(&mut fetcher, 250, ShaderStage::Vertex)
            .vertex_buffer;
        let second = ctx
            .stage_output(&mut fetcher, 250, ShaderStage::Vertex)
            .vertex_buffer;
        assert_eq!(first, second);
        assert_eq!(fetcher.fetches, 1);

        ctx.register_event_alias(250, 251);
        let via_alias = ctx
            .stage_output(&mut fetcher, 251, ShaderStage::Vertex)
            .vertex_buffer;
        assert_eq!(via_alias, first);
        assert_eq!(fetcher.fetches, 1);
    }

    #[test]
    fn close_releases_buffers_and_clears_tables() {
        let mut ctx = loaded_context();
        let mut fetcher = StubFetcher::new();
        ctx.stage_output(&mut fetcher, 100, ShaderStage::Vertex);
        ctx.rename_resource(5, "shadow map");
        ctx.toggle_bookmark(250);
        ctx.set_note("frame", "stutters here");

        ctx.close(&mut fetcher);
        assert!(!ctx.is_loaded());
        assert_eq!(fetcher.released.len(), 1);
        assert!(ctx.event_map().is_empty());
        assert_eq!(ctx.resource_name(5), None);
        assert!(ctx.bookmarks().is_empty());
        assert_eq!(ctx.note("frame"), None);
    }

    #[test]
    fn bookmarks_toggle() {
        let mut ctx = loaded_context();
        ctx.toggle_bookmark(100);
        ctx.toggle_bookmark(250);
        ctx.toggle_bookmark(100);
        assert_eq!(ctx.bookmarks(), &[250]);
    }

    #[test]
    fn device_lost_hook_sets_the_session_flag() {
        let ctx = CaptureContext::new();
        assert!(!ctx.is_device_lost());
        let hook = ctx.device_lost_hook();
        hook("queue submit");
        assert!(ctx.is_device_lost());
    }
}
