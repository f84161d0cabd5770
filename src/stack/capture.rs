//! Fixed-capacity call-stack records.

use std::fmt;

/// Deepest stack a capture can hold.
pub const MAX_NUM_FRAMES: usize = 62;

/// Hash of a stack's frame addresses.
///
/// Equal traces always have equal ids; equal ids do not imply equal traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct StackId(pub u32);

impl fmt::Display for StackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// Hash a frame array into a [`StackId`].
pub fn compute_stack_id(frames: &[usize]) -> StackId {
    // FNV-1a over whole frame words, folded to 32 bits.
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &frame in frames {
        hash ^= frame as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    StackId((hash ^ (hash >> 32)) as u32)
}

/// A captured call stack, held by value.
///
/// Holds at most `max_frames` return addresses, innermost first.
#[derive(Clone, Copy)]
pub struct StackCapture {
    stack_id: StackId,
    num_frames: usize,
    max_frames: usize,
    frames: [usize; MAX_NUM_FRAMES],
}

impl StackCapture {
    /// Words of bookkeeping stored ahead of the frames.
    pub(crate) const HEADER_WORDS: usize = 3;

    /// An empty capture with room for [`MAX_NUM_FRAMES`] frames.
    pub fn new() -> Self {
        Self::with_max_frames(MAX_NUM_FRAMES)
    }

    /// An empty capture holding at most `max_frames` frames.
    pub fn with_max_frames(max_frames: usize) -> Self {
        debug_assert!(max_frames > 0);
        Self {
            stack_id: StackId::default(),
            num_frames: 0,
            max_frames: max_frames.min(MAX_NUM_FRAMES),
            frames: [0; MAX_NUM_FRAMES],
        }
    }

    /// Bytes needed to store a capture of `max_frames` frames.
    pub const fn size(max_frames: usize) -> usize {
        (Self::HEADER_WORDS + max_frames) * std::mem::size_of::<usize>()
    }

    /// Largest frame count whose record fits in `bytes`.
    pub const fn max_frames_for_size(bytes: usize) -> usize {
        let words = bytes / std::mem::size_of::<usize>();
        if words <= Self::HEADER_WORDS {
            0
        } else {
            let frames = words - Self::HEADER_WORDS;
            if frames < MAX_NUM_FRAMES {
                frames
            } else {
                MAX_NUM_FRAMES
            }
        }
    }

    /// Copy up to `max_frames` entries of `frames` and take `stack_id` as
    /// the hash.
    pub fn init_from_frames(&mut self, stack_id: StackId, frames: &[usize]) {
        debug_assert!(!frames.is_empty());
        let count = frames.len().min(self.max_frames);
        self.frames[..count].copy_from_slice(&frames[..count]);
        self.num_frames = count;
        self.stack_id = stack_id;
    }

    /// Capture the calling thread's stack.
    ///
    /// The capture machinery's own frames are dropped from the innermost
    /// end, and `bottom_frames_to_skip` frames from the outermost end. The
    /// id hashes the frames that are kept.
    #[inline(never)]
    pub fn init_from_current_stack(&mut self, bottom_frames_to_skip: usize) {
        self.walk_current_stack(bottom_frames_to_skip);
        self.stack_id = compute_stack_id(self.frames());
    }

    /// Like [`StackCapture::init_from_current_stack`], but the id is
    /// computed from module-relative frame addresses so that it stays stable
    /// across runs with different load addresses.
    #[inline(never)]
    pub fn init_from_current_stack_relative(&mut self, bottom_frames_to_skip: usize) {
        let bases = self.walk_current_stack(bottom_frames_to_skip);
        let relative: Vec<usize> = self
            .frames()
            .iter()
            .zip(bases.iter())
            .map(|(&frame, &base)| frame.wrapping_sub(base))
            .collect();
        self.stack_id = compute_stack_id(&relative);
    }

    /// Fill the frame array, returning the module base of each kept frame
    /// (0 where the platform does not report one).
    #[inline(always)]
    fn walk_current_stack(&mut self, bottom_frames_to_skip: usize) -> Vec<usize> {
        let mut frames = [0usize; MAX_NUM_FRAMES];
        let mut bases = [0usize; MAX_NUM_FRAMES];
        let mut count = 0;
        let mut complete = true;
        let mut own_frames = true;

        backtrace::trace(|frame| {
            let ip = frame.ip() as usize;
            // Skip the unwinder and this capture until the first caller frame.
            if own_frames {
                let mut ours = false;
                backtrace::resolve_frame(frame, |symbol| {
                    if let Some(name) = symbol.name() {
                        let name = name.to_string();
                        ours = name.contains("backtrace::") || name.contains("StackCapture");
                    }
                });
                if ours {
                    return true;
                }
                own_frames = false;
            }

            if count == MAX_NUM_FRAMES {
                complete = false;
                return false;
            }
            frames[count] = ip;
            bases[count] = frame.module_base_address().map_or(0, |base| base as usize);
            count += 1;
            true
        });

        // Bottom frames are only known when the walk reached the stack base.
        if complete {
            count = count.saturating_sub(bottom_frames_to_skip);
        }
        let count = count.min(self.max_frames);

        self.frames[..count].copy_from_slice(&frames[..count]);
        self.num_frames = count;
        bases[..count].to_vec()
    }

    /// Override the id.
    pub fn set_stack_id(&mut self, stack_id: StackId) {
        self.stack_id = stack_id;
    }

    /// Hash of the frames.
    pub fn stack_id(&self) -> StackId {
        self.stack_id
    }

    /// Number of valid frames.
    pub fn num_frames(&self) -> usize {
        self.num_frames
    }

    /// Capacity of this capture.
    pub fn max_frames(&self) -> usize {
        self.max_frames
    }

    /// The valid frames, innermost first.
    pub fn frames(&self) -> &[usize] {
        &self.frames[..self.num_frames]
    }

    /// Whether no frame was captured.
    pub fn is_empty(&self) -> bool {
        self.num_frames == 0
    }
}

impl Default for StackCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for StackCapture {
    fn eq(&self, other: &Self) -> bool {
        self.frames() == other.frames()
    }
}

impl Eq for StackCapture {}

impl std::hash::Hash for StackCapture {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.stack_id.hash(state);
    }
}

impl fmt::Debug for StackCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackCapture")
            .field("stack_id", &self.stack_id)
            .field("num_frames", &self.num_frames)
            .field("max_frames", &self.max_frames)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_from_frames_truncates() {
        let frames: Vec<usize> = (1..=10).collect();
        let mut capture = StackCapture::with_max_frames(4);
        capture.init_from_frames(StackId(7), &frames);

        assert_eq!(capture.num_frames(), 4);
        assert_eq!(capture.frames(), &[1, 2, 3, 4]);
        assert_eq!(capture.stack_id(), StackId(7));
    }

    #[test]
    fn test_max_frames_is_capped() {
        let capture = StackCapture::with_max_frames(1000);
        assert_eq!(capture.max_frames(), MAX_NUM_FRAMES);
    }

    #[test]
    fn test_size() {
        let word = std::mem::size_of::<usize>();
        assert_eq!(StackCapture::size(0), 3 * word);
        assert_eq!(StackCapture::size(10), 13 * word);
        assert_eq!(StackCapture::max_frames_for_size(StackCapture::size(10)), 10);
        assert_eq!(StackCapture::max_frames_for_size(2 * word), 0);
        assert_eq!(StackCapture::max_frames_for_size(1 << 20), MAX_NUM_FRAMES);
    }

    #[test]
    fn test_equality_is_by_frames() {
        let mut a = StackCapture::new();
        let mut b = StackCapture::new();
        a.init_from_frames(StackId(1), &[0x10, 0x20]);
        b.init_from_frames(StackId(1), &[0x10, 0x30]);
        assert_ne!(a, b);

        b.init_from_frames(StackId(2), &[0x10, 0x20]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_stack_id_depends_on_order() {
        assert_eq!(compute_stack_id(&[1, 2, 3]), compute_stack_id(&[1, 2, 3]));
        assert_ne!(compute_stack_id(&[1, 2, 3]), compute_stack_id(&[3, 2, 1]));
    }

    #[inline(never)]
    fn capture_here() -> StackCapture {
        let mut capture = StackCapture::new();
        capture.init_from_current_stack(0);
        capture
    }

    #[test]
    fn test_current_stack() {
        let capture = capture_here();
        assert!(capture.num_frames() > 0);
        assert_eq!(capture.stack_id(), compute_stack_id(capture.frames()));

        // Dropping outer frames never adds any.
        let mut trimmed = StackCapture::new();
        trimmed.init_from_current_stack(2);
        assert!(trimmed.num_frames() <= capture.num_frames());
    }

    #[test]
    fn test_relative_id_keeps_frames() {
        let mut capture = StackCapture::new();
        capture.init_from_current_stack_relative(0);
        assert!(capture.num_frames() > 0);
        assert!(capture.frames().iter().all(|&f| f != 0));
    }
}
