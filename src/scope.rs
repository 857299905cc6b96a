//! A nested, task-local namespace mapping channel names to instances.
//!
//! A [`Scope`] is a frame in a tree: every frame has an optional parent, an
//! `isolated` flag, and a name → channel map. [`enter_scope`] pushes a new
//! frame onto the *current task's* stack and returns a [`ScopeGuard`] whose
//! `Drop` pops it back off — tolerating out-of-order disposal, since a
//! caller may hold two guards and drop the outer one first.
//!
//! "Task-local" here is keyed by [`tokio::task::Id`] rather than by OS
//! thread, since a task can be polled on a different worker thread after
//! every `.await` on the multi-threaded runtime. Code that never runs
//! inside a spawned task (direct calls from a thread, e.g. a synchronous
//! test) falls back to a per-thread key, which is equivalent as long as
//! that thread never migrates the call across an await point itself.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex as PlMutex;

use crate::channel::{Channel, ChannelConfig};
use crate::error::{ChannelError, Result, ScopeError};

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum TaskKey {
    Task(tokio::task::Id),
    Thread(std::thread::ThreadId),
}

fn current_task_key() -> TaskKey {
    tokio::task::try_id().map(TaskKey::Task).unwrap_or_else(|| TaskKey::Thread(std::thread::current().id()))
}

struct FrameNode {
    id: u64,
    parent: Option<Arc<FrameNode>>,
    isolated: bool,
    channels: PlMutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    disposed: AtomicBool,
}

impl FrameNode {
    fn new(parent: Option<Arc<FrameNode>>, isolated: bool) -> Arc<Self> {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            parent,
            isolated,
            channels: PlMutex::new(HashMap::new()),
            disposed: AtomicBool::new(false),
        })
    }

    /// Looks up `name`, walking ancestor frames unless this frame is
    /// isolated, in which case lookup stops here (§4.7).
    fn lookup<T: Send + 'static>(&self, name: &str) -> Option<Channel<T>> {
        if let Some(existing) = self.channels.lock().get(name)
            && let Some(channel) = existing.downcast_ref::<Channel<T>>()
        {
            return Some(channel.clone());
        }
        if self.isolated {
            return None;
        }
        self.parent.as_ref().and_then(|p| p.lookup(name))
    }
}

fn root_frame() -> Arc<FrameNode> {
    static ROOT: OnceLock<Arc<FrameNode>> = OnceLock::new();
    ROOT.get_or_init(|| FrameNode::new(None, false)).clone()
}

static TASK_FRAMES: PlMutex<Option<HashMap<TaskKey, Vec<Arc<FrameNode>>>>> = PlMutex::new(None);

fn current_frame() -> Arc<FrameNode> {
    let key = current_task_key();
    let registry = TASK_FRAMES.lock();
    if let Some(map) = registry.as_ref()
        && let Some(stack) = map.get(&key)
    {
        for frame in stack.iter().rev() {
            if !frame.disposed.load(Ordering::Acquire) {
                return frame.clone();
            }
        }
    }
    root_frame()
}

fn push_frame(frame: Arc<FrameNode>) {
    let key = current_task_key();
    let mut registry = TASK_FRAMES.lock();
    registry.get_or_insert_with(HashMap::new).entry(key).or_default().push(frame);
}

/// Marks `frame_id` disposed on the given task's stack and opportunistically
/// pops any now-dead entries off the tail, so a stack that disposes in
/// reverse order (the common case) never grows unbounded.
fn dispose_frame(key: TaskKey, frame_id: u64) {
    let mut registry = TASK_FRAMES.lock();
    let Some(map) = registry.as_mut() else { return };
    let Some(stack) = map.get_mut(&key) else { return };
    if let Some(frame) = stack.iter().find(|f| f.id == frame_id) {
        frame.disposed.store(true, Ordering::Release);
    }
    while matches!(stack.last(), Some(f) if f.disposed.load(Ordering::Acquire)) {
        stack.pop();
    }
    if stack.is_empty() {
        map.remove(&key);
    }
}

/// A naming frame: binds channel names to channel instances, with an
/// optional parent to fall back to. Cheap to clone (an `Arc` handle).
#[derive(Clone)]
pub struct Scope {
    frame: Arc<FrameNode>,
}

impl Scope {
    /// The process-wide root frame. Always present, never disposable.
    pub fn root() -> Self {
        Self { frame: root_frame() }
    }

    /// The frame currently active for the calling task (or the root frame,
    /// if no [`enter_scope`] is in effect).
    pub fn current() -> Self {
        Self { frame: current_frame() }
    }

    pub fn is_isolated(&self) -> bool {
        self.frame.isolated
    }

    /// Looks up `name` in this frame (or `config`, on miss, constructs and
    /// binds a new channel here). Lookup walks ancestors unless this frame
    /// is isolated.
    pub fn get_or_create<T: Send + 'static>(&self, name: impl Into<String>, config: ChannelConfig) -> Result<Channel<T>> {
        let name = name.into();
        if let Some(existing) = self.frame.lookup::<T>(&name) {
            return Ok(existing);
        }
        let mut channels = self.frame.channels.lock();
        // Re-check under the lock: another task may have raced us since the
        // lookup above released it.
        if let Some(existing) = channels.get(&name) {
            return existing
                .downcast_ref::<Channel<T>>()
                .cloned()
                .ok_or_else(|| ChannelError::InvalidArgument(format!("channel {name:?} already bound to a different type")));
        }
        let channel = Channel::<T>::new(ChannelConfig { name: Some(name.clone()), ..config })?;
        channels.insert(name, Arc::new(channel.clone()));
        Ok(channel)
    }

    /// Binds an existing channel under `name` in this frame, shadowing any
    /// ancestor binding of the same name.
    pub fn inject<T: Send + 'static>(&self, name: impl Into<String>, channel: Channel<T>) {
        self.frame.channels.lock().insert(name.into(), Arc::new(channel));
    }

    /// Imports `name`'s binding from the nearest ancestor frame into this
    /// one. Only meaningful on an isolated frame (otherwise lookups already
    /// fall through to ancestors); fails if no ancestor binds `name`.
    pub fn inject_from_parent<T: Send + 'static>(&self, name: impl Into<String>) -> std::result::Result<(), ScopeError> {
        if !self.frame.isolated {
            return Err(ScopeError::NotIsolated);
        }
        let name = name.into();
        let Some(parent) = &self.frame.parent else {
            return Err(ScopeError::UnknownInjection(name));
        };
        let Some(channel) = parent.lookup::<T>(&name) else {
            return Err(ScopeError::UnknownInjection(name));
        };
        self.frame.channels.lock().insert(name, Arc::new(channel));
        Ok(())
    }
}

impl PartialEq for Scope {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.frame, &other.frame)
    }
}
impl Eq for Scope {}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope").field("id", &self.frame.id).field("isolated", &self.frame.isolated).finish()
    }
}

/// Pushes a new frame, child of [`Scope::current`], onto the calling task's
/// stack. Dropping the returned guard pops it back off, restoring whatever
/// was current before — even if an inner guard created afterward is still
/// alive or gets dropped out of order.
pub fn enter_scope(isolated: bool) -> ScopeGuard {
    let parent = current_frame();
    let frame = FrameNode::new(Some(parent), isolated);
    push_frame(frame.clone());
    ScopeGuard {
        task_key: current_task_key(),
        frame_id: frame.id,
        scope: Scope { frame },
    }
}

/// RAII handle for a frame pushed by [`enter_scope`]. Derefs to [`Scope`] so
/// callers can use it directly; dropping it calls the equivalent of
/// `leave_scope()`.
pub struct ScopeGuard {
    task_key: TaskKey,
    frame_id: u64,
    scope: Scope,
}

impl std::ops::Deref for ScopeGuard {
    type Target = Scope;
    fn deref(&self) -> &Scope {
        &self.scope
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        dispose_frame(self.task_key, self.frame_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_or_create_binds_in_the_current_frame() {
        let scope = enter_scope(false);
        let a = scope.get_or_create::<i32>("ping", ChannelConfig::default()).unwrap();
        let b = scope.get_or_create::<i32>("ping", ChannelConfig::default()).unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn child_frame_sees_parent_bindings_unless_isolated() {
        let outer = enter_scope(false);
        let c = outer.get_or_create::<i32>("shared", ChannelConfig::default()).unwrap();

        {
            let inner = enter_scope(false);
            let seen = inner.get_or_create::<i32>("shared", ChannelConfig::default()).unwrap();
            assert_eq!(seen, c);
        }
        {
            let isolated = enter_scope(true);
            let fresh = isolated.get_or_create::<i32>("shared", ChannelConfig::default()).unwrap();
            assert_ne!(fresh, c);
        }
    }

    #[tokio::test]
    async fn inject_from_parent_imports_a_single_name_into_isolation() {
        let outer = enter_scope(false);
        let c = outer.get_or_create::<i32>("shared", ChannelConfig::default()).unwrap();
        outer.get_or_create::<i32>("only_outer", ChannelConfig::default()).unwrap();

        let isolated = enter_scope(true);
        isolated.inject_from_parent::<i32>("shared").unwrap();
        let seen = isolated.get_or_create::<i32>("shared", ChannelConfig::default()).unwrap();
        assert_eq!(seen, c);

        assert_eq!(isolated.inject_from_parent::<i32>("nonexistent"), Err(ScopeError::UnknownInjection("nonexistent".into())));
    }

    #[tokio::test]
    async fn inject_from_parent_on_a_non_isolated_frame_is_rejected() {
        let scope = enter_scope(false);
        assert_eq!(scope.inject_from_parent::<i32>("anything"), Err(ScopeError::NotIsolated));
    }

    #[tokio::test]
    async fn out_of_order_disposal_restores_the_right_current_frame() {
        let outer = enter_scope(false);
        let outer_channel = outer.get_or_create::<i32>("outer_only", ChannelConfig::default()).unwrap();

        let inner = enter_scope(false);
        drop(outer); // drop the outer guard first, while `inner` is still alive

        assert_eq!(Scope::current(), *inner);
        drop(inner);
        // Both disposed: current should fall back to root, which has no
        // binding for this name.
        let fresh = Scope::current().get_or_create::<i32>("outer_only", ChannelConfig::default()).unwrap();
        assert_ne!(fresh, outer_channel);
    }
}
