//! # Debug-Info Entries
//!
//! A [`Tag`] is a non-owning locator for one entry: where it lives in
//! `.debug_info`, which abbreviation declares it, and where its attribute
//! bytes start. Attributes are decoded on demand by walking the declaration's
//! `(name, form)` list in lockstep with the entry bytes.
//!
//! Subtrees are skipped by following `DW_AT_sibling` when the producer
//! emitted a usable one, and otherwise by counting nesting depth through the
//! null entries that close every child list.

use gimli::constants::{self, DwAt, DwForm, DwTag};

use super::abbrev::read_attr_spec;
use super::attr::{read_form, resolve_value, select_class, Attribute, AttributeValue, FormContext, FormValue};
use super::unit::UnitRef;
use crate::cursor::BinaryCursor;
use crate::error::{Result, SymError};

/// Locator for one debug-info entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag
{
    /// `.debug_info` offset of the entry
    pub offset: u64,
    pub code: u64,
    pub tag: DwTag,
    pub has_children: bool,
    /// `.debug_abbrev` offset of the first attribute specification
    pub abbrev_offset: usize,
    /// `.debug_info` offset of the first attribute value
    attrs_offset: usize,
}

/// Raw `(name, form, value)` triples of one entry, unresolved
pub struct RawAttrs<'data>
{
    specs: BinaryCursor<'data>,
    values: BinaryCursor<'data>,
    context: FormContext,
    done: bool,
}

impl<'data> RawAttrs<'data>
{
    /// Consume the remaining attributes and return the offset just past them.
    pub fn finish(mut self) -> Result<usize>
    {
        while let Some(raw) = self.next() {
            raw?;
        }
        Ok(self.values.offset())
    }

    fn step(&mut self) -> Result<Option<(DwAt, DwForm, FormValue<'data>)>>
    {
        let (name, form, implicit_const) = read_attr_spec(&mut self.specs)?;
        if name.0 == 0 && form.0 == 0 {
            return Ok(None);
        }
        let value = read_form(&mut self.values, form, implicit_const, self.context)?;
        Ok(Some((name, form, value)))
    }
}

impl<'data> Iterator for RawAttrs<'data>
{
    type Item = Result<(DwAt, DwForm, FormValue<'data>)>;

    fn next(&mut self) -> Option<Self::Item>
    {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// Decoded attributes of one entry
///
/// Attributes whose class is ignored are skipped; the first decoding error is
/// yielded and ends the iteration.
pub struct AttrIter<'a, 'data>
{
    raw: RawAttrs<'data>,
    unit: UnitRef<'a, 'data>,
}

impl<'data> Iterator for AttrIter<'_, 'data>
{
    type Item = Result<Attribute<'data>>;

    fn next(&mut self) -> Option<Self::Item>
    {
        loop {
            let (name, form, raw) = match self.raw.next()? {
                Ok(item) => item,
                Err(err) => return Some(Err(err)),
            };
            let class = match select_class(name, form) {
                Ok(Some(class)) => class,
                Ok(None) => continue,
                Err(err) => {
                    self.raw.done = true;
                    return Some(Err(err));
                }
            };
            return Some(resolve_value(class, raw, &self.unit).map(|value| Attribute { name, form, value }));
        }
    }
}

/// Children of one entry, in order
pub struct Children<'a, 'data>
{
    unit: UnitRef<'a, 'data>,
    next: Option<u64>,
}

impl Iterator for Children<'_, '_>
{
    type Item = Result<Tag>;

    fn next(&mut self) -> Option<Self::Item>
    {
        let offset = self.next.take()?;
        if offset >= self.unit.unit.header.end as u64 {
            return None;
        }
        let tag = match self.unit.entry(offset) {
            Ok(Some(tag)) => tag,
            Ok(None) => return None,
            Err(err) => return Some(Err(err)),
        };
        match self.unit.next_sibling(&tag) {
            Ok(next) => self.next = Some(next),
            Err(err) => return Some(Err(err)),
        }
        Some(Ok(tag))
    }
}

impl<'a, 'data> UnitRef<'a, 'data>
{
    fn info_cursor(&self, offset: usize) -> BinaryCursor<'data>
    {
        let encoding = self.encoding();
        BinaryCursor::with_range(self.sections.debug_info, offset, self.unit.header.end)
            .with_address_size(encoding.address_size)
            .with_format(encoding.format)
    }

    /// Entry at `offset`, or `None` for a null entry.
    pub fn entry(&self, offset: u64) -> Result<Option<Tag>>
    {
        if !self.unit.header.contains(offset) {
            return Err(SymError::malformed(format!(
                "entry 0x{offset:x} outside unit 0x{:x}",
                self.unit.header.offset
            )));
        }
        let mut cursor = self.info_cursor(offset as usize);
        let code = cursor.read_uleb128()?;
        if code == 0 {
            return Ok(None);
        }
        let abbrev = self
            .unit
            .abbrevs
            .get(code)
            .ok_or_else(|| SymError::malformed(format!("unknown abbreviation code {code} at 0x{offset:x}")))?;
        Ok(Some(Tag {
            offset,
            code,
            tag: abbrev.tag,
            has_children: abbrev.has_children,
            abbrev_offset: abbrev.attrs_offset,
            attrs_offset: cursor.offset(),
        }))
    }

    /// Entry at `offset`, treating a null entry as corruption.
    pub fn tag_at(&self, offset: u64) -> Result<Tag>
    {
        self.entry(offset)?
            .ok_or_else(|| SymError::malformed(format!("null entry referenced at 0x{offset:x}")))
    }

    pub fn root(&self) -> Result<Tag>
    {
        self.tag_at(self.unit.root_offset())
    }

    pub fn raw_attrs(&self, tag: &Tag) -> RawAttrs<'data>
    {
        RawAttrs {
            specs: BinaryCursor::with_range(
                self.sections.debug_abbrev,
                tag.abbrev_offset,
                self.sections.debug_abbrev.len(),
            ),
            values: self.info_cursor(tag.attrs_offset),
            context: FormContext {
                version: self.encoding().version,
                unit_offset: self.unit.header.offset,
            },
            done: false,
        }
    }

    pub fn attrs(&self, tag: &Tag) -> AttrIter<'a, 'data>
    {
        AttrIter {
            raw: self.raw_attrs(tag),
            unit: *self,
        }
    }

    /// Value of the attribute `name`, resolving only that attribute.
    pub fn attr(&self, tag: &Tag, name: DwAt) -> Result<Option<AttributeValue<'data>>>
    {
        for raw in self.raw_attrs(tag) {
            let (attr_name, form, value) = raw?;
            if attr_name != name {
                continue;
            }
            return match select_class(attr_name, form)? {
                Some(class) => resolve_value(class, value, self).map(Some),
                None => Ok(None),
            };
        }
        Ok(None)
    }

    /// `DW_AT_name` as a string.
    pub fn name(&self, tag: &Tag) -> Result<Option<&'data [u8]>>
    {
        Ok(self.attr(tag, constants::DW_AT_name)?.and_then(|value| value.as_str()))
    }

    /// Children of `tag` (empty when it declares none).
    pub fn children(&self, tag: &Tag) -> Result<Children<'a, 'data>>
    {
        let next = if tag.has_children {
            Some(self.raw_attrs(tag).finish()? as u64)
        } else {
            None
        };
        Ok(Children { unit: *self, next })
    }

    /// Offset of the entry following `tag`'s subtree.
    pub fn next_sibling(&self, tag: &Tag) -> Result<u64>
    {
        let mut sibling = None;
        let mut raw = self.raw_attrs(tag);
        for item in raw.by_ref() {
            if let (constants::DW_AT_sibling, _, FormValue::InfoRef(offset)) = item? {
                sibling = Some(offset);
            }
        }
        let attrs_end = raw.values.offset() as u64;
        if !tag.has_children {
            return Ok(attrs_end);
        }
        if let Some(offset) = sibling.filter(|&offset| offset > attrs_end && offset <= self.unit.header.end as u64) {
            return Ok(offset);
        }
        self.skip_children(attrs_end)
    }

    /// Walk from the first child to just past the null entry that closes the
    /// list, descending into grandchildren as needed.
    fn skip_children(&self, first_child: u64) -> Result<u64>
    {
        let end = self.unit.header.end as u64;
        let mut offset = first_child;
        let mut depth = 1usize;
        while depth > 0 {
            if offset >= end {
                // Producers may omit the trailing null entries of the root.
                return Ok(end);
            }
            match self.entry(offset)? {
                None => {
                    depth -= 1;
                    offset += 1;
                }
                Some(child) => {
                    offset = self.raw_attrs(&child).finish()? as u64;
                    if child.has_children {
                        depth += 1;
                    }
                }
            }
        }
        Ok(offset)
    }

    /// Depth-first walk of the subtree below `tag`, calling `visit` with each
    /// entry and its depth (1 for direct children). Returning `false` from
    /// `visit` prunes that entry's children.
    pub fn walk(&self, tag: &Tag, visit: &mut dyn FnMut(&Tag, usize) -> Result<bool>) -> Result<()>
    {
        let mut stack = vec![self.children(tag)?];
        while let Some(children) = stack.last_mut() {
            let Some(child) = children.next() else {
                stack.pop();
                continue;
            };
            let child = child?;
            if visit(&child, stack.len())? && child.has_children {
                let grandchildren = self.children(&child)?;
                stack.push(grandchildren);
            }
        }
        Ok(())
    }
}
