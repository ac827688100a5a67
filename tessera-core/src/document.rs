//! The document tree shared by every pipeline stage.
//!
//! Blocks live in one id-keyed map owned by the [`Document`]; pages and
//! parent blocks only hold ordered id lists. Every structural mutation goes
//! through this module and checks child-kind legality before touching
//! anything, so a failed mutation leaves the tree unchanged.

use std::collections::{HashMap, HashSet};

use crate::{
    blocks::{Block, BlockContent, BlockKind, BlockMetadata},
    entities::{BBox, BlockID, DocumentMetadata, Page, PageID},
    error::ModelError,
};

/// Where a block sits: directly on a page or under another block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parent {
    Page(PageID),
    Block(BlockID),
}

#[derive(Debug, Clone)]
pub struct Document {
    pages: Vec<Page>,
    blocks: HashMap<BlockID, Block>,
    next_block_id: BlockID,
    pub metadata: DocumentMetadata,
}

impl Document {
    pub fn new(metadata: DocumentMetadata) -> Self {
        Self {
            pages: Vec::new(),
            blocks: HashMap::new(),
            next_block_id: 0,
            metadata,
        }
    }

    pub fn add_page(&mut self, width: f32, height: f32) -> PageID {
        let id = self.pages.len();
        self.pages.push(Page::new(id, width, height));
        id
    }

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    pub fn page(&self, id: PageID) -> Result<&Page, ModelError> {
        self.pages.get(id).ok_or(ModelError::UnknownPage(id))
    }

    pub(crate) fn page_mut(&mut self, id: PageID) -> Result<&mut Page, ModelError> {
        self.pages.get_mut(id).ok_or(ModelError::UnknownPage(id))
    }

    pub fn block(&self, id: BlockID) -> Result<&Block, ModelError> {
        self.blocks.get(&id).ok_or(ModelError::UnknownBlock(id))
    }

    pub fn block_mut(&mut self, id: BlockID) -> Result<&mut Block, ModelError> {
        self.blocks.get_mut(&id).ok_or(ModelError::UnknownBlock(id))
    }

    pub fn contains(&self, id: BlockID) -> bool {
        self.blocks.contains_key(&id)
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Next id the document will hand out. Never decreases.
    pub fn next_block_id(&self) -> BlockID {
        self.next_block_id
    }

    fn check_placement(&self, parent: Parent, kind: BlockKind) -> Result<PageID, ModelError> {
        match parent {
            Parent::Page(page_id) => {
                self.page(page_id)?;
                if kind.is_child_only() {
                    return Err(ModelError::IllegalTopLevel(kind));
                }
                Ok(page_id)
            }
            Parent::Block(parent_id) => {
                let parent = self.block(parent_id)?;
                if !parent.kind().allows_child(kind) {
                    return Err(ModelError::IllegalChild {
                        parent: parent.kind(),
                        child: kind,
                    });
                }
                Ok(parent.page_id)
            }
        }
    }

    fn child_list_mut(&mut self, parent: Parent) -> Result<&mut Vec<BlockID>, ModelError> {
        match parent {
            Parent::Page(page_id) => Ok(&mut self.page_mut(page_id)?.blocks),
            Parent::Block(block_id) => Ok(&mut self.block_mut(block_id)?.children),
        }
    }

    fn child_list(&self, parent: Parent) -> Result<&[BlockID], ModelError> {
        match parent {
            Parent::Page(page_id) => Ok(&self.page(page_id)?.blocks),
            Parent::Block(block_id) => Ok(&self.block(block_id)?.children),
        }
    }

    /// Creates a block under `parent` at `index` (appended when `None`).
    pub fn insert(
        &mut self,
        parent: Parent,
        index: Option<usize>,
        bbox: BBox,
        content: BlockContent,
    ) -> Result<BlockID, ModelError> {
        let page_id = self.check_placement(parent, content.kind())?;
        let len = self.child_list(parent)?.len();
        let index = index.unwrap_or(len).min(len);

        let id = self.next_block_id;
        self.next_block_id += 1;
        self.blocks.insert(
            id,
            Block {
                id,
                page_id,
                parent: match parent {
                    Parent::Page(_) => None,
                    Parent::Block(p) => Some(p),
                },
                children: Vec::new(),
                bbox,
                content,
                metadata: BlockMetadata::default(),
            },
        );
        self.child_list_mut(parent)?.insert(index, id);
        Ok(id)
    }

    /// Appends a new top-level block to `page`.
    pub fn push_block(
        &mut self,
        page: PageID,
        bbox: BBox,
        content: BlockContent,
    ) -> Result<BlockID, ModelError> {
        self.insert(Parent::Page(page), None, bbox, content)
    }

    pub fn append_child(
        &mut self,
        parent: BlockID,
        bbox: BBox,
        content: BlockContent,
    ) -> Result<BlockID, ModelError> {
        self.insert(Parent::Block(parent), None, bbox, content)
    }

    /// Creates a block right after `anchor`, in the same parent list.
    pub fn insert_after(
        &mut self,
        anchor: BlockID,
        bbox: BBox,
        content: BlockContent,
    ) -> Result<BlockID, ModelError> {
        let parent = self.parent_of(anchor)?;
        let pos = self.position_in(parent, anchor)?;
        self.insert(parent, Some(pos + 1), bbox, content)
    }

    pub fn parent_of(&self, id: BlockID) -> Result<Parent, ModelError> {
        let block = self.block(id)?;
        Ok(match block.parent {
            Some(p) => Parent::Block(p),
            None => Parent::Page(block.page_id),
        })
    }

    fn position_in(&self, parent: Parent, id: BlockID) -> Result<usize, ModelError> {
        self.child_list(parent)?
            .iter()
            .position(|&b| b == id)
            .ok_or_else(|| ModelError::Inconsistent(format!("block {id} missing from its parent")))
    }

    /// Removes `id` and its whole subtree, detaching it from its parent list.
    pub fn remove_block(&mut self, id: BlockID) -> Result<Block, ModelError> {
        let parent = self.parent_of(id)?;
        let pos = self.position_in(parent, id)?;
        self.child_list_mut(parent)?.remove(pos);

        let mut stack = self.block(id)?.children.clone();
        while let Some(child) = stack.pop() {
            if let Some(b) = self.blocks.remove(&child) {
                stack.extend(b.children);
            }
        }
        self.blocks.remove(&id).ok_or(ModelError::UnknownBlock(id))
    }

    /// Replaces the top-level order of `page`. `order` must hold exactly the
    /// page's current top-level ids.
    pub fn set_page_blocks(&mut self, page: PageID, order: Vec<BlockID>) -> Result<(), ModelError> {
        self.reorder(Parent::Page(page), order)
    }

    /// Replaces the child order of `parent`, same rule as
    /// [`Document::set_page_blocks`].
    pub fn set_children(&mut self, parent: BlockID, order: Vec<BlockID>) -> Result<(), ModelError> {
        self.reorder(Parent::Block(parent), order)
    }

    fn reorder(&mut self, parent: Parent, order: Vec<BlockID>) -> Result<(), ModelError> {
        let current = self.child_list(parent)?;
        let same_len = current.len() == order.len();
        let current: HashSet<_> = current.iter().copied().collect();
        let proposed: HashSet<_> = order.iter().copied().collect();
        if !same_len || proposed.len() != order.len() || current != proposed {
            return Err(ModelError::NotAPermutation {
                owner: match parent {
                    Parent::Page(p) => format!("page {p}"),
                    Parent::Block(b) => format!("block {b}"),
                },
            });
        }
        *self.child_list_mut(parent)? = order;
        Ok(())
    }

    /// Moves `id` with its subtree under `new_parent` at `index`.
    pub fn reparent(
        &mut self,
        id: BlockID,
        new_parent: Parent,
        index: Option<usize>,
    ) -> Result<(), ModelError> {
        let kind = self.block(id)?.kind();
        let page_id = self.check_placement(new_parent, kind)?;
        if let Parent::Block(mut cursor) = new_parent {
            loop {
                if cursor == id {
                    return Err(ModelError::Cycle { block: id });
                }
                match self.block(cursor)?.parent {
                    Some(p) => cursor = p,
                    None => break,
                }
            }
        }

        let old_parent = self.parent_of(id)?;
        let pos = self.position_in(old_parent, id)?;
        self.child_list_mut(old_parent)?.remove(pos);

        let list = self.child_list_mut(new_parent)?;
        let index = index.unwrap_or(list.len()).min(list.len());
        list.insert(index, id);

        let block = self.block_mut(id)?;
        block.parent = match new_parent {
            Parent::Page(_) => None,
            Parent::Block(p) => Some(p),
        };
        self.set_subtree_page(id, page_id)
    }

    fn set_subtree_page(&mut self, root: BlockID, page_id: PageID) -> Result<(), ModelError> {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let block = self.block_mut(id)?;
            block.page_id = page_id;
            stack.extend(block.children.iter().copied());
        }
        Ok(())
    }

    /// Swaps the payload of `id`. A kind change is only allowed when the new
    /// kind is legal in the block's parent and for all of its children.
    pub fn replace_content(&mut self, id: BlockID, content: BlockContent) -> Result<(), ModelError> {
        let block = self.block(id)?;
        let from = block.kind();
        let to = content.kind();
        if from != to {
            let parent = self.parent_of(id)?;
            self.check_placement(parent, to)?;
            for child in &block.children {
                let child_kind = self.block(*child)?.kind();
                if !to.allows_child(child_kind) {
                    return Err(ModelError::KindChange { block: id, from, to });
                }
            }
        }
        self.block_mut(id)?.content = content;
        Ok(())
    }

    /// Removes every child of `parent` and creates `children` in order.
    pub fn replace_children(
        &mut self,
        parent: BlockID,
        children: Vec<(BBox, BlockContent)>,
    ) -> Result<Vec<BlockID>, ModelError> {
        let parent_kind = self.block(parent)?.kind();
        if let Some((_, c)) = children
            .iter()
            .find(|(_, c)| !parent_kind.allows_child(c.kind()))
        {
            return Err(ModelError::IllegalChild {
                parent: parent_kind,
                child: c.kind(),
            });
        }
        for child in self.block(parent)?.children.clone() {
            self.remove_block(child)?;
        }
        children
            .into_iter()
            .map(|(bbox, content)| self.append_child(parent, bbox, content))
            .collect()
    }

    /// Ids of every block reachable from `page`, depth-first in document
    /// order, paired with their depth.
    pub fn walk_page(&self, page: PageID) -> Result<Vec<(usize, BlockID)>, ModelError> {
        let mut out = Vec::new();
        let mut stack: Vec<(usize, BlockID)> = self
            .page(page)?
            .blocks
            .iter()
            .rev()
            .map(|&id| (0, id))
            .collect();
        while let Some((depth, id)) = stack.pop() {
            out.push((depth, id));
            stack.extend(self.block(id)?.children.iter().rev().map(|&c| (depth + 1, c)));
        }
        Ok(out)
    }

    /// Every block id in document order: pages, then depth-first.
    pub fn block_ids(&self) -> Vec<BlockID> {
        (0..self.pages.len())
            .filter_map(|p| self.walk_page(p).ok())
            .flatten()
            .map(|(_, id)| id)
            .collect()
    }

    /// Ids of blocks of `kind`, in document order.
    pub fn blocks_of_kind(&self, kind: BlockKind) -> Vec<BlockID> {
        self.block_ids()
            .into_iter()
            .filter(|id| self.blocks.get(id).is_some_and(|b| b.kind() == kind))
            .collect()
    }

    /// Checks every tree invariant.
    pub fn validate(&self) -> Result<(), ModelError> {
        let mut seen: HashSet<BlockID> = HashSet::with_capacity(self.blocks.len());

        for (idx, page) in self.pages.iter().enumerate() {
            if page.id != idx {
                return Err(ModelError::Inconsistent(format!(
                    "page at index {idx} carries id {}",
                    page.id
                )));
            }
            let mut stack: Vec<(Option<BlockID>, BlockID)> =
                page.blocks.iter().map(|&id| (None, id)).collect();
            while let Some((parent, id)) = stack.pop() {
                let block = self.block(id)?;
                if !seen.insert(id) {
                    return Err(ModelError::Inconsistent(format!(
                        "block {id} is reachable more than once"
                    )));
                }
                if block.id != id {
                    return Err(ModelError::Inconsistent(format!(
                        "block stored under {id} carries id {}",
                        block.id
                    )));
                }
                if id >= self.next_block_id {
                    return Err(ModelError::Inconsistent(format!(
                        "block {id} is ahead of the id counter"
                    )));
                }
                if block.page_id != page.id {
                    return Err(ModelError::Inconsistent(format!(
                        "block {id} points at page {} but sits on page {}",
                        block.page_id, page.id
                    )));
                }
                if block.parent != parent {
                    return Err(ModelError::Inconsistent(format!(
                        "block {id} has a stale parent reference"
                    )));
                }
                match parent {
                    None if block.kind().is_child_only() => {
                        return Err(ModelError::IllegalTopLevel(block.kind()))
                    }
                    Some(p) => {
                        let parent_kind = self.block(p)?.kind();
                        if !parent_kind.allows_child(block.kind()) {
                            return Err(ModelError::IllegalChild {
                                parent: parent_kind,
                                child: block.kind(),
                            });
                        }
                    }
                    None => {}
                }
                stack.extend(block.children.iter().map(|&c| (Some(id), c)));
            }
        }

        if seen.len() != self.blocks.len() {
            let orphan = self
                .blocks
                .keys()
                .filter(|id| !seen.contains(id))
                .min()
                .copied()
                .unwrap_or_default();
            return Err(ModelError::Inconsistent(format!(
                "block {orphan} is not reachable from any page"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::{
        blocks::{List, Table, TableCell, TextBlock},
        detect::InputKind,
    };

    fn doc() -> Document {
        let mut doc = Document::new(DocumentMetadata::new(
            "test".into(),
            PathBuf::from("test.txt"),
            InputKind::Text,
        ));
        doc.add_page(612.0, 792.0);
        doc.add_page(612.0, 792.0);
        doc
    }

    fn text(s: &str) -> BlockContent {
        BlockContent::Text(TextBlock::new(s))
    }

    fn cell(row: usize, col: usize) -> BlockContent {
        BlockContent::TableCell(TableCell {
            text: format!("{row}:{col}"),
            row,
            col,
            row_span: 1,
            col_span: 1,
            header: row == 0,
        })
    }

    #[test]
    fn rejects_illegal_children_at_mutation_time() {
        let mut doc = doc();
        let table = doc
            .push_block(0, BBox::default(), BlockContent::Table(Table::default()))
            .unwrap();
        let para = doc.push_block(0, BBox::default(), text("para")).unwrap();

        let err = doc.append_child(table, BBox::default(), text("x")).unwrap_err();
        assert_eq!(
            err,
            ModelError::IllegalChild {
                parent: BlockKind::Table,
                child: BlockKind::Text
            }
        );
        assert!(matches!(
            doc.push_block(0, BBox::default(), cell(0, 0)),
            Err(ModelError::IllegalTopLevel(BlockKind::TableCell))
        ));
        assert!(doc.reparent(para, Parent::Block(table), None).is_err());
        // nothing changed
        assert_eq!(doc.block_count(), 2);
        doc.validate().unwrap();
    }

    #[test]
    fn remove_detaches_subtree_and_keeps_counter() {
        let mut doc = doc();
        let table = doc
            .push_block(1, BBox::default(), BlockContent::Table(Table::default()))
            .unwrap();
        for c in 0..3 {
            doc.append_child(table, BBox::default(), cell(0, c)).unwrap();
        }
        let next = doc.next_block_id();
        doc.remove_block(table).unwrap();
        assert_eq!(doc.block_count(), 0);
        assert!(doc.page(1).unwrap().blocks().is_empty());
        doc.validate().unwrap();

        let fresh = doc.push_block(1, BBox::default(), text("again")).unwrap();
        assert_eq!(fresh, next);
    }

    #[test]
    fn reorder_requires_permutation() {
        let mut doc = doc();
        let a = doc.push_block(0, BBox::default(), text("a")).unwrap();
        let b = doc.push_block(0, BBox::default(), text("b")).unwrap();
        let c = doc.push_block(1, BBox::default(), text("c")).unwrap();

        assert!(doc.set_page_blocks(0, vec![a]).is_err());
        assert!(doc.set_page_blocks(0, vec![a, c]).is_err());
        assert!(doc.set_page_blocks(0, vec![a, a]).is_err());
        doc.set_page_blocks(0, vec![b, a]).unwrap();
        assert_eq!(doc.page(0).unwrap().blocks(), &[b, a]);
    }

    #[test]
    fn reparent_moves_subtree_across_pages() {
        let mut doc = doc();
        let outer = doc
            .push_block(0, BBox::default(), BlockContent::List(List::default()))
            .unwrap();
        let item = doc
            .append_child(outer, BBox::default(), BlockContent::ListItem(TextBlock::new("i")))
            .unwrap();
        let nested = doc
            .append_child(item, BBox::default(), BlockContent::List(List::default()))
            .unwrap();

        assert_eq!(
            doc.reparent(outer, Parent::Block(item), None),
            Err(ModelError::Cycle { block: outer })
        );
        assert!(matches!(
            doc.reparent(outer, Parent::Block(nested), None),
            Err(ModelError::IllegalChild { .. })
        ));

        doc.reparent(nested, Parent::Page(1), None).unwrap();
        assert_eq!(doc.block(nested).unwrap().page_id(), 1);
        assert_eq!(doc.block(nested).unwrap().parent(), None);
        doc.validate().unwrap();
    }

    #[test]
    fn reparent_detects_cycles() {
        let mut doc = doc();
        let list = doc
            .push_block(0, BBox::default(), BlockContent::List(List::default()))
            .unwrap();
        let item = doc
            .append_child(list, BBox::default(), BlockContent::ListItem(TextBlock::new("i")))
            .unwrap();
        let inner = doc
            .append_child(item, BBox::default(), BlockContent::List(List::default()))
            .unwrap();
        let inner_item = doc
            .append_child(inner, BBox::default(), BlockContent::ListItem(TextBlock::new("j")))
            .unwrap();

        // the outer list can't move under its own grandchild item
        assert_eq!(
            doc.reparent(list, Parent::Block(inner_item), None),
            Err(ModelError::Cycle { block: list })
        );
        doc.validate().unwrap();
    }

    #[test]
    fn validate_catches_kind_switch_through_content_mut() {
        let mut doc = doc();
        let table = doc
            .push_block(0, BBox::default(), BlockContent::Table(Table::default()))
            .unwrap();
        doc.append_child(table, BBox::default(), cell(0, 0)).unwrap();
        *doc.block_mut(table).unwrap().content_mut() = text("oops");
        assert!(matches!(
            doc.validate(),
            Err(ModelError::IllegalChild { .. })
        ));
    }

    #[test]
    fn replace_content_refuses_orphaning_children() {
        let mut doc = doc();
        let table = doc
            .push_block(0, BBox::default(), BlockContent::Table(Table::default()))
            .unwrap();
        doc.append_child(table, BBox::default(), cell(0, 0)).unwrap();
        assert!(matches!(
            doc.replace_content(table, text("flat")),
            Err(ModelError::KindChange { .. })
        ));
        let para = doc.push_block(0, BBox::default(), text("p")).unwrap();
        doc.replace_content(para, BlockContent::Table(Table::default()))
            .unwrap();
        doc.validate().unwrap();
    }

    #[test]
    fn walk_is_depth_first_in_order() {
        let mut doc = doc();
        let a = doc.push_block(0, BBox::default(), text("a")).unwrap();
        let t = doc
            .push_block(0, BBox::default(), BlockContent::Table(Table::default()))
            .unwrap();
        let c0 = doc.append_child(t, BBox::default(), cell(0, 0)).unwrap();
        let c1 = doc.append_child(t, BBox::default(), cell(0, 1)).unwrap();
        let b = doc.insert_after(a, BBox::default(), text("b")).unwrap();

        let walk = doc.walk_page(0).unwrap();
        assert_eq!(walk, vec![(0, a), (0, b), (0, t), (1, c0), (1, c1)]);
        assert_eq!(doc.blocks_of_kind(BlockKind::TableCell), vec![c0, c1]);
    }
}
