/*
 * Height-Hinted Binary Search Tree
 *
 * Self-balancing intrusive BST used by the region tracker. Each node carries
 * an i16 height hint; after a mutation the hint is recomputed locally and a
 * rotation fires when the balance exceeds one. The result is neither AVL nor
 * red-black, just approximately balanced, which is cheap and good enough for
 * region counts.
 *
 * The tree is intrusive: an SpNode is embedded as the first field of its
 * container and links are raw pointers, resolved back to the container by
 * address identity. Key comparison stays with the caller, which walks down
 * to a leaf itself and then calls insert() with the found parent and
 * direction.
 */

use core::ptr;

/// Intrusive tree node. Embed as the first field (repr(C)) of the container
/// so node pointers can be cast back.
#[repr(C)]
#[derive(Debug)]
pub struct SpNode {
    left: *mut SpNode,
    right: *mut SpNode,
    parent: *mut SpNode,
    hint: i16,
}

impl SpNode {
    pub const fn new() -> SpNode {
        SpNode {
            left: ptr::null_mut(),
            right: ptr::null_mut(),
            parent: ptr::null_mut(),
            hint: 0,
        }
    }

    pub fn left(&self) -> *mut SpNode {
        self.left
    }

    pub fn right(&self) -> *mut SpNode {
        self.right
    }
}

impl Default for SpNode {
    fn default() -> Self {
        SpNode::new()
    }
}

/// Tree root.
#[derive(Debug)]
pub struct SpRoot {
    root: *mut SpNode,
}

// Only touched under the big kernel lock.
unsafe impl Send for SpRoot {}

impl SpRoot {
    pub const fn new() -> SpRoot {
        SpRoot {
            root: ptr::null_mut(),
        }
    }

    pub fn root(&self) -> *mut SpNode {
        self.root
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_null()
    }
}

impl Default for SpRoot {
    fn default() -> Self {
        SpRoot::new()
    }
}

/// Which child slot of the parent a new node lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpDir {
    Left,
    Right,
}

unsafe fn balance(n: *mut SpNode) -> i32 {
    unsafe {
        let l = if !(*n).left.is_null() {
            (*(*n).left).hint as i32 + 1
        } else {
            0
        };
        let r = if !(*n).right.is_null() {
            (*(*n).right).hint as i32 + 1
        } else {
            0
        };
        l - r
    }
}

unsafe fn max_hint(n: *mut SpNode) -> i16 {
    unsafe {
        let l = if !(*n).left.is_null() {
            (*(*n).left).hint + 1
        } else {
            0
        };
        let r = if !(*n).right.is_null() {
            (*(*n).right).hint + 1
        } else {
            0
        };
        l.max(r)
    }
}

/// Rotation for a left-leaning node: the left child comes up.
unsafe fn turn_left(n: *mut SpNode) {
    unsafe {
        let l = (*n).left;
        let p = (*n).parent;

        (*l).parent = (*n).parent;
        (*n).left = (*l).right;
        (*n).parent = l;
        (*l).right = n;

        if !p.is_null() && (*p).left == n {
            (*p).left = l;
        } else if !p.is_null() {
            (*p).right = l;
        }

        if !(*n).left.is_null() {
            (*(*n).left).parent = n;
        }
    }
}

/// Rotation for a right-leaning node: the right child comes up.
unsafe fn turn_right(n: *mut SpNode) {
    unsafe {
        let r = (*n).right;
        let p = (*n).parent;

        (*r).parent = (*n).parent;
        (*n).right = (*r).left;
        (*n).parent = r;
        (*r).left = n;

        if !p.is_null() && (*p).left == n {
            (*p).left = r;
        } else if !p.is_null() {
            (*p).right = r;
        }

        if !(*n).right.is_null() {
            (*(*n).right).parent = n;
        }
    }
}

/// Walk from `n` towards the root, refreshing hints and rotating where the
/// balance tips over. Stops as soon as a hint settles.
unsafe fn update(root: &mut SpRoot, mut n: *mut SpNode) {
    unsafe {
        while !n.is_null() {
            let b = balance(n);
            let prev_hint = (*n).hint;
            let p = (*n).parent;

            if b < -1 {
                // leaning to the right
                if n == root.root {
                    root.root = (*n).right;
                }

                turn_right(n);
            } else if b > 1 {
                // leaning to the left
                if n == root.root {
                    root.root = (*n).left;
                }

                turn_left(n);
            }

            (*n).hint = max_hint(n);
            if (*n).hint == 0 || (*n).hint != prev_hint {
                n = p;
            } else {
                return;
            }
        }
    }
}

/// Link `n` below `parent` in the given direction and rebalance. The caller
/// has already walked the tree; `parent` is ignored for the first node.
///
/// # Safety
///
/// `n` must point to a live node not currently in any tree, `parent` must be
/// a node of this tree with a free child slot in direction `dir` (or
/// arbitrary when the tree is empty).
pub unsafe fn insert(root: &mut SpRoot, parent: *mut SpNode, n: *mut SpNode, dir: SpDir) {
    unsafe {
        *n = SpNode::new();

        if root.root.is_null() {
            root.root = n;
            return;
        }

        match dir {
            SpDir::Left => (*parent).left = n,
            SpDir::Right => (*parent).right = n,
        }

        (*n).parent = parent;
        update(root, n);
    }
}

/// Replace `n` with its in-order successor `r` (leftmost of n's right
/// subtree).
unsafe fn replace_right(n: *mut SpNode, r: *mut SpNode) {
    unsafe {
        let p = (*n).parent;
        let rp = (*r).parent;

        if (*rp).left == r {
            (*rp).left = (*r).right;
            if !(*r).right.is_null() {
                (*(*r).right).parent = rp;
            }
        }

        if (*rp).parent == n {
            (*rp).parent = r;
        }

        (*r).parent = p;
        (*r).left = (*n).left;

        if (*n).right != r {
            (*r).right = (*n).right;
            (*(*n).right).parent = r;
        }

        if !p.is_null() && (*p).left == n {
            (*p).left = r;
        } else if !p.is_null() {
            (*p).right = r;
        }

        if !(*n).left.is_null() {
            (*(*n).left).parent = r;
        }
    }
}

/// Replace `n` with its in-order predecessor `l` (rightmost of n's left
/// subtree).
unsafe fn replace_left(n: *mut SpNode, l: *mut SpNode) {
    unsafe {
        let p = (*n).parent;
        let lp = (*l).parent;

        if (*lp).right == l {
            (*lp).right = (*l).left;
            if !(*l).left.is_null() {
                (*(*l).left).parent = lp;
            }
        }

        if (*lp).parent == n {
            (*lp).parent = l;
        }

        (*l).parent = p;
        (*l).right = (*n).right;

        if (*n).left != l {
            (*l).left = (*n).left;
            (*(*n).left).parent = l;
        }

        if !p.is_null() && (*p).left == n {
            (*p).left = l;
        } else if !p.is_null() {
            (*p).right = l;
        }

        if !(*n).right.is_null() {
            (*(*n).right).parent = l;
        }
    }
}

/// Unlink `del` from the tree. The node's links are left stale; zero them
/// before reinserting.
///
/// # Safety
///
/// `del` must be a live node of this tree.
pub unsafe fn remove(root: &mut SpRoot, del: *mut SpNode) {
    unsafe {
        if !(*del).right.is_null() {
            let least = first((*del).right);

            if del == root.root {
                root.root = least;
            }

            replace_right(del, least);
            update(root, (*least).right);
            return;
        }

        if !(*del).left.is_null() {
            let most = last((*del).left);

            if del == root.root {
                root.root = most;
            }

            replace_left(del, most);
            update(root, (*most).left);
            return;
        }

        if del == root.root {
            root.root = ptr::null_mut();
            return;
        }

        // leaf with a parent
        let parent = (*del).parent;

        if (*parent).left == del {
            (*parent).left = ptr::null_mut();
        } else {
            (*parent).right = ptr::null_mut();
        }

        update(root, parent);
    }
}

/// Leftmost node of a subtree.
///
/// # Safety
///
/// `n` must be a live node.
pub unsafe fn first(mut n: *mut SpNode) -> *mut SpNode {
    unsafe {
        while !(*n).left.is_null() {
            n = (*n).left;
        }
    }
    n
}

/// Rightmost node of a subtree.
///
/// # Safety
///
/// `n` must be a live node.
pub unsafe fn last(mut n: *mut SpNode) -> *mut SpNode {
    unsafe {
        while !(*n).right.is_null() {
            n = (*n).right;
        }
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    struct Item {
        node: SpNode,
        key: usize,
    }

    fn item(key: usize) -> Box<Item> {
        Box::new(Item {
            node: SpNode::new(),
            key,
        })
    }

    unsafe fn key_of(n: *mut SpNode) -> usize {
        unsafe { (*(n as *mut Item)).key }
    }

    unsafe fn insert_item(root: &mut SpRoot, it: &mut Item) {
        unsafe {
            let mut n = root.root();
            let mut p = core::ptr::null_mut();
            let mut dir = SpDir::Left;
            while !n.is_null() {
                p = n;
                if it.key < key_of(n) {
                    n = (*n).left();
                    dir = SpDir::Left;
                } else {
                    n = (*n).right();
                    dir = SpDir::Right;
                }
            }
            insert(root, p, &mut it.node as *mut SpNode, dir);
        }
    }

    unsafe fn collect(n: *mut SpNode, out: &mut Vec<usize>, depth: usize, max_depth: &mut usize) {
        unsafe {
            if n.is_null() {
                return;
            }
            *max_depth = (*max_depth).max(depth);
            collect((*n).left(), out, depth + 1, max_depth);
            out.push(key_of(n));
            collect((*n).right(), out, depth + 1, max_depth);
        }
    }

    #[test]
    fn insert_keeps_order_and_balance() {
        let mut root = SpRoot::new();
        let mut items: Vec<Box<Item>> = (0..256).map(item).collect();
        for it in items.iter_mut() {
            unsafe { insert_item(&mut root, it) };
        }

        let mut out = Vec::new();
        let mut depth = 0;
        unsafe { collect(root.root(), &mut out, 0, &mut depth) };
        assert_eq!(out, (0..256).collect::<Vec<_>>());
        // sorted insertion is the known worst case for the hint heuristic,
        // it must still stay within a small factor of log2(n)
        assert!(depth < 32, "degenerate tree, depth {depth}");
    }

    #[test]
    fn remove_preserves_order() {
        let mut root = SpRoot::new();
        let keys = [50, 20, 80, 10, 30, 70, 90, 25, 35, 60];
        let mut items: Vec<Box<Item>> = keys.iter().map(|&k| item(k)).collect();
        for it in items.iter_mut() {
            unsafe { insert_item(&mut root, it) };
        }

        // remove an inner node, a leaf and the root in turn
        let mut gone: Vec<usize> = Vec::new();
        for victim in [30usize, 10, 50] {
            let it = items.iter_mut().find(|i| i.key == victim).unwrap();
            unsafe { remove(&mut root, &mut it.node as *mut SpNode) };
            gone.push(victim);

            let mut out = Vec::new();
            let mut depth = 0;
            unsafe { collect(root.root(), &mut out, 0, &mut depth) };
            let mut expect: Vec<usize> = keys
                .iter()
                .copied()
                .filter(|k| !gone.contains(k))
                .collect();
            expect.sort_unstable();
            assert_eq!(out, expect);
        }
    }

    #[test]
    fn first_and_last() {
        let mut root = SpRoot::new();
        let mut items: Vec<Box<Item>> = [5usize, 1, 9, 3, 7].iter().map(|&k| item(k)).collect();
        for it in items.iter_mut() {
            unsafe { insert_item(&mut root, it) };
        }
        unsafe {
            assert_eq!(key_of(first(root.root())), 1);
            assert_eq!(key_of(last(root.root())), 9);
        }
    }
}
