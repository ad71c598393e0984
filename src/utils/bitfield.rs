//! Bit-field encoding helpers for packed 32-bit words.

pub struct BitField<const SIZE: u32, const POSITION: u32>;

impl<const SIZE: u32, const POSITION: u32> BitField<SIZE, POSITION> {
    pub const NEXT_BIT: u32 = POSITION + SIZE;

    #[inline(always)]
    pub const fn mask() -> u32 {
        if SIZE == 32 {
            u32::MAX
        } else {
            (1 << SIZE) - 1
        }
    }

    #[inline(always)]
    pub const fn mask_in_place() -> u32 {
        Self::mask() << POSITION
    }

    #[inline(always)]
    pub const fn shift() -> u32 {
        POSITION
    }

    #[inline(always)]
    pub const fn bitsize() -> u32 {
        SIZE
    }

    #[inline(always)]
    pub const fn is_valid(value: u32) -> bool {
        Self::decode(Self::encode(value)) == value
    }

    #[inline(always)]
    pub const fn decode(word: u32) -> u32 {
        (word >> POSITION) & Self::mask()
    }

    #[inline(always)]
    pub const fn encode(value: u32) -> u32 {
        (value & Self::mask()) << POSITION
    }

    #[inline(always)]
    pub const fn update(value: u32, original: u32) -> u32 {
        Self::encode(value) | (!Self::mask_in_place() & original)
    }
}
